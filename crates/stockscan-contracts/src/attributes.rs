use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Wire keys of the attribute schema, in the order the extraction prompt lists them.
pub const ATTRIBUTE_KEYS: [&str; 6] = [
    "main_object",
    "main_color",
    "secondary_colors",
    "shape",
    "material",
    "features",
];

/// Visual description of a single cropped object, as emitted by the vision model.
///
/// The producer is a remote LLM, so decoding goes through [`AttributeRecord::from_map`],
/// which treats missing or mistyped fields as empty instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributeRecord {
    #[serde(default)]
    pub main_object: String,
    #[serde(default)]
    pub main_color: String,
    #[serde(default)]
    pub secondary_colors: Vec<String>,
    #[serde(default)]
    pub shape: String,
    #[serde(default)]
    pub material: String,
    #[serde(default)]
    pub features: Vec<String>,
}

impl AttributeRecord {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            main_object: text_field(map, "main_object"),
            main_color: text_field(map, "main_color"),
            secondary_colors: text_list(map, "secondary_colors"),
            shape: text_field(map, "shape"),
            material: text_field(map, "material"),
            features: text_list(map, "features"),
        }
    }

    /// Lower-cased concatenation of every field, used for lexical matching.
    pub fn text_blob(&self) -> String {
        let secondary = self.secondary_colors.join(" ");
        let features = self.features.join(" ");
        [
            self.main_object.as_str(),
            self.main_color.as_str(),
            secondary.as_str(),
            self.shape.as_str(),
            self.material.as_str(),
            features.as_str(),
        ]
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<&str>>()
        .join(" ")
        .to_lowercase()
    }

    pub fn is_empty(&self) -> bool {
        self.text_blob().is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// The three shapes a vision answer can take once resolved at the parse boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    SingleItem(AttributeRecord),
    MultiItem(Vec<AttributeRecord>),
    Unparseable { raw: String, reason: String },
}

impl AnalysisOutcome {
    pub fn records(&self) -> Vec<&AttributeRecord> {
        match self {
            Self::SingleItem(record) => vec![record],
            Self::MultiItem(records) => records.iter().collect(),
            Self::Unparseable { .. } => Vec::new(),
        }
    }

    /// First record of the answer; the one used for single-object matching.
    pub fn primary(&self) -> Option<&AttributeRecord> {
        self.records().into_iter().next()
    }

    pub fn is_parsed(&self) -> bool {
        !matches!(self, Self::Unparseable { .. })
    }

    /// `{"error": ..., "raw": ...}` for unparseable answers, `None` otherwise.
    pub fn to_error_record(&self) -> Option<Value> {
        match self {
            Self::Unparseable { raw, reason } => Some(json!({
                "error": reason,
                "raw": raw,
            })),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::SingleItem(record) => serde_json::to_value(record).unwrap_or(Value::Null),
            Self::MultiItem(records) => serde_json::to_value(records).unwrap_or(Value::Null),
            Self::Unparseable { .. } => self.to_error_record().unwrap_or(Value::Null),
        }
    }
}

/// Resolves raw model text into an [`AnalysisOutcome`]. Never fails.
pub fn parse_analysis(raw: &str) -> AnalysisOutcome {
    let Some(value) = extract_json_value(raw) else {
        return unparseable(raw, "response is not valid JSON");
    };
    match value {
        Value::Object(map) => {
            if let Some(error) = error_message(&map) {
                return unparseable(raw, &error);
            }
            if !has_attribute_keys(&map) {
                return unparseable(raw, "JSON object has none of the attribute fields");
            }
            AnalysisOutcome::SingleItem(AttributeRecord::from_map(&map))
        }
        Value::Array(rows) => {
            let mut records = rows
                .iter()
                .filter_map(Value::as_object)
                .filter(|map| has_attribute_keys(map))
                .map(AttributeRecord::from_map)
                .collect::<Vec<AttributeRecord>>();
            match records.len() {
                0 => unparseable(raw, "JSON array holds no attribute objects"),
                1 => AnalysisOutcome::SingleItem(records.remove(0)),
                _ => AnalysisOutcome::MultiItem(records),
            }
        }
        _ => unparseable(raw, "JSON value is neither an object nor an array"),
    }
}

/// Serialises `{"error": message}`, the shape every failed remote call degrades to.
pub fn error_record(message: &str) -> String {
    json!({ "error": message }).to_string()
}

/// Finds the JSON payload in a model answer that may be fenced or wrapped in prose.
pub fn extract_json_value(text: &str) -> Option<Value> {
    let raw = strip_code_fence(text);
    if raw.trim().is_empty() {
        return None;
    }
    let mut candidates = vec![raw.clone()];
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (raw.find(open), raw.rfind(close)) {
            if end > start {
                candidates.push(raw[start..=end].to_string());
            }
        }
    }
    candidates
        .into_iter()
        .find_map(|candidate| serde_json::from_str::<Value>(&candidate).ok())
        .filter(|value| value.is_object() || value.is_array())
}

pub fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    let Some(open) = raw.find("```") else {
        return raw.to_string();
    };
    let after_open = &raw[open + 3..];
    let Some(close) = after_open.find("```") else {
        return raw.to_string();
    };
    let mut body = after_open[..close].trim();
    if body
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("json"))
    {
        body = body[4..].trim();
    }
    body.to_string()
}

fn unparseable(raw: &str, reason: &str) -> AnalysisOutcome {
    AnalysisOutcome::Unparseable {
        raw: raw.to_string(),
        reason: reason.to_string(),
    }
}

fn error_message(map: &Map<String, Value>) -> Option<String> {
    if has_attribute_keys(map) {
        return None;
    }
    match map.get("error")? {
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn has_attribute_keys(map: &Map<String, Value>) -> bool {
    ATTRIBUTE_KEYS.iter().any(|key| map.contains_key(*key))
}

fn text_field(map: &Map<String, Value>, key: &str) -> String {
    scalar_text(map.get(key)).unwrap_or_default()
}

fn text_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(|row| scalar_text(Some(row)))
            .filter(|text| !text.is_empty())
            .collect(),
        Some(Value::String(text)) => text
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
