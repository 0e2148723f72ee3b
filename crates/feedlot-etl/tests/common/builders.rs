//! Builders for configs and CSV fixtures.

#![allow(dead_code)]

use serde_json::{json, Map, Value};

use feedlot_etl::config::{load_config_from_str, EtlConfig};

pub const ORG_A: &str = "5b1e0f3a-0000-4000-8000-000000000001";
pub const ORG_B: &str = "9c2d7e41-0000-4000-8000-000000000002";

/// Builds the JSON form of an `EtlConfig` so tests go through the loader.
pub struct ConfigBuilder {
    sections: Map<String, Value>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut sections = Map::new();
        sections.insert("version".to_string(), json!("1.0"));
        Self { sections }
    }

    pub fn require_approval(mut self, required: bool) -> Self {
        self.section("lifecycle")
            .insert("require_approval".to_string(), json!(required));
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.section("batch")
            .insert("batch_size".to_string(), json!(size));
        self.section("parsing")
            .insert("batch_size".to_string(), json!(size));
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        let retry = self.section("retry");
        retry.insert("max_retries".to_string(), json!(retries));
        retry.insert("jitter".to_string(), json!(false));
        self
    }

    /// Base delay before the first retry; later retries back off from it.
    pub fn retry_delay_ms(mut self, delay: u64) -> Self {
        self.section("retry")
            .insert("base_delay_ms".to_string(), json!(delay));
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        let workers = self.section("workers");
        workers.insert("count".to_string(), json!(count));
        workers.insert("poll_interval_ms".to_string(), json!(50));
        self
    }

    pub fn shift_alias(mut self, alias: &str, canonical: &str) -> Self {
        let aliases = self.section("aliases");
        let shifts = aliases
            .entry("shifts".to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(map) = shifts {
            map.insert(alias.to_string(), json!(canonical));
        }
        self
    }

    pub fn raw(mut self, section: &str, key: &str, value: Value) -> Self {
        self.section(section).insert(key.to_string(), value);
        self
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.sections.clone()).to_string()
    }

    pub fn build(&self) -> EtlConfig {
        load_config_from_str(&self.to_json()).expect("test config should load")
    }

    fn section(&mut self, name: &str) -> &mut Map<String, Value> {
        let entry = self
            .sections
            .entry(name.to_string())
            .or_insert_with(|| json!({}));
        match entry {
            Value::Object(map) => map,
            _ => panic!("section {} is not an object", name),
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles CSV text line by line.
pub struct CsvBuilder {
    separator: char,
    lines: Vec<String>,
}

impl CsvBuilder {
    pub fn new(separator: char) -> Self {
        Self {
            separator,
            lines: Vec::new(),
        }
    }

    pub fn header(self, columns: &[&str]) -> Self {
        self.row(columns)
    }

    pub fn row(mut self, values: &[&str]) -> Self {
        let sep = self.separator.to_string();
        self.lines.push(values.join(&sep));
        self
    }

    pub fn blank_line(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn raw_line(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    pub fn build(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Distribution export as the feed management software writes it.
pub fn distribution_csv() -> String {
    CsvBuilder::new(';')
        .header(&[
            "Data",
            "Hora",
            "Turno",
            "Vagão",
            "Curral",
            "Dieta",
            "Previsto (kg)",
            "Realizado",
            "Operador",
        ])
        .row(&[
            "15/01/2024",
            "06:30",
            "Manhã",
            "Bahman",
            "C-12",
            "Terminação",
            "1.200,00",
            "1.250,50",
            "JOÃO DA SILVA",
        ])
        .row(&[
            "15/01/2024",
            "07:10",
            "manha",
            "BAHMAN",
            "C13",
            "TERMINACAO",
            "800",
            "790",
            "Maria",
        ])
        .row(&[
            "15/01/2024",
            "14:00",
            "Tarde",
            "Bahman",
            "C-12",
            "Terminação",
            "1.100,00",
            "1.080,00",
            "João da Silva",
        ])
        .build()
}
