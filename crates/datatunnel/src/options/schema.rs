use super::{format_float, OptionValue, OptionsBag, RawOptions};
use crate::error::OptionsError;
use crate::types::REDACTED;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::warn;

/// What to do with keys a connector schema does not declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownOptionPolicy {
    /// Fail validation with `UnknownOption`
    #[default]
    Reject,
    /// Log a warning and drop the key
    Warn,
}

/// Declared type of an option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    String,
    Integer,
    Float,
    Boolean,
    StringList,
    /// List of JSON objects (inline rows)
    Records,
    /// String restricted to a fixed set of choices, matched case-insensitively
    OneOf(&'static [&'static str]),
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::String => f.write_str("string"),
            OptionType::Integer => f.write_str("integer"),
            OptionType::Float => f.write_str("float"),
            OptionType::Boolean => f.write_str("boolean"),
            OptionType::StringList => f.write_str("list of strings"),
            OptionType::Records => f.write_str("list of records"),
            OptionType::OneOf(choices) => write!(f, "one of [{}]", choices.join(", ")),
        }
    }
}

impl OptionType {
    /// Coerce a raw value to this type, or `None` if it cannot be
    pub fn coerce(&self, value: &OptionValue) -> Option<OptionValue> {
        match (self, value) {
            (OptionType::String, OptionValue::String(_)) => Some(value.clone()),
            (OptionType::String, OptionValue::Integer(i)) => {
                Some(OptionValue::String(i.to_string()))
            }
            (OptionType::String, OptionValue::Float(v)) => {
                Some(OptionValue::String(format_float(*v)))
            }
            (OptionType::String, OptionValue::Boolean(b)) => {
                Some(OptionValue::String(b.to_string()))
            }

            (OptionType::Integer, OptionValue::Integer(_)) => Some(value.clone()),
            (OptionType::Integer, OptionValue::String(s)) => {
                s.trim().parse::<i64>().ok().map(OptionValue::Integer)
            }

            (OptionType::Float, OptionValue::Float(_)) => Some(value.clone()),
            (OptionType::Float, OptionValue::Integer(i)) => Some(OptionValue::Float(*i as f64)),
            (OptionType::Float, OptionValue::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(OptionValue::Float),

            (OptionType::Boolean, OptionValue::Boolean(_)) => Some(value.clone()),
            (OptionType::Boolean, OptionValue::String(s)) => {
                if s.eq_ignore_ascii_case("true") {
                    Some(OptionValue::Boolean(true))
                } else if s.eq_ignore_ascii_case("false") {
                    Some(OptionValue::Boolean(false))
                } else {
                    None
                }
            }

            (OptionType::StringList, OptionValue::String(_)) => {
                Some(OptionValue::List(vec![value.clone()]))
            }
            (OptionType::StringList, OptionValue::List(items)) => items
                .iter()
                .map(|item| match item {
                    OptionValue::List(_) | OptionValue::Object(_) => None,
                    scalar => OptionType::String.coerce(scalar),
                })
                .collect::<Option<Vec<_>>>()
                .map(OptionValue::List),

            (OptionType::Records, OptionValue::List(items)) => {
                if items.iter().all(|i| matches!(i, OptionValue::Object(_))) {
                    Some(value.clone())
                } else {
                    None
                }
            }

            (OptionType::OneOf(choices), OptionValue::String(s)) => choices
                .iter()
                .find(|c| c.eq_ignore_ascii_case(s))
                .map(|c| OptionValue::String(c.to_string())),

            _ => None,
        }
    }
}

/// One declared option of a connector kind
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub key: &'static str,
    pub ty: OptionType,
    pub required: bool,
    pub default: Option<OptionValue>,
    pub sensitive: bool,
    pub aliases: Vec<&'static str>,
    pub description: &'static str,
}

impl OptionSpec {
    fn matches(&self, key: &str) -> bool {
        self.key == key || self.aliases.iter().any(|a| *a == key)
    }
}

/// The flat key/value contract a connector kind publishes.
///
/// Built with a small builder:
///
/// ```rust
/// use datatunnel::options::{OptionSchema, OptionType, OptionValue};
///
/// let schema = OptionSchema::new("mysql")
///     .required("host", OptionType::String, "Server host name")
///     .with_default("port", OptionType::Integer, 3306, "Server port")
///     .required("password", OptionType::String, "Login password")
///     .sensitive();
/// assert!(schema.is_sensitive("password"));
/// ```
#[derive(Debug, Clone)]
pub struct OptionSchema {
    kind: String,
    options: Vec<OptionSpec>,
}

impl OptionSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: Vec::new(),
        }
    }

    pub fn required(mut self, key: &'static str, ty: OptionType, description: &'static str) -> Self {
        self.options.push(OptionSpec {
            key,
            ty,
            required: true,
            default: None,
            sensitive: false,
            aliases: Vec::new(),
            description,
        });
        self
    }

    /// Optional option without a default
    pub fn optional(mut self, key: &'static str, ty: OptionType, description: &'static str) -> Self {
        self.options.push(OptionSpec {
            key,
            ty,
            required: false,
            default: None,
            sensitive: false,
            aliases: Vec::new(),
            description,
        });
        self
    }

    pub fn with_default(
        mut self,
        key: &'static str,
        ty: OptionType,
        default: impl Into<OptionValue>,
        description: &'static str,
    ) -> Self {
        self.options.push(OptionSpec {
            key,
            ty,
            required: false,
            default: Some(default.into()),
            sensitive: false,
            aliases: Vec::new(),
            description,
        });
        self
    }

    /// Standard `columns` projection option, defaulting to `["*"]`
    pub fn with_columns(self) -> Self {
        self.with_default(
            super::COLUMNS,
            OptionType::StringList,
            OptionValue::string_list(["*"]),
            "Column projection and order; [\"*\"] keeps every column",
        )
    }

    /// Mark the most recently declared option as sensitive
    pub fn sensitive(mut self) -> Self {
        if let Some(last) = self.options.last_mut() {
            last.sensitive = true;
        }
        self
    }

    /// Accept an alternative spelling for the most recently declared option
    pub fn alias(mut self, alias: &'static str) -> Self {
        if let Some(last) = self.options.last_mut() {
            last.aliases.push(alias);
        }
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn options(&self) -> &[OptionSpec] {
        &self.options
    }

    pub fn get(&self, key: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|spec| spec.matches(key))
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.get(key).map(|spec| spec.sensitive).unwrap_or(false)
    }

    /// Validate raw statement options against this schema.
    ///
    /// Keys are visited in sorted order so the first reported error is
    /// deterministic. Missing required keys are checked after every supplied
    /// key has been validated.
    pub fn parse(
        &self,
        raw: &RawOptions,
        policy: UnknownOptionPolicy,
    ) -> Result<OptionsBag, OptionsError> {
        let mut values = BTreeMap::new();
        let mut supplied_as: HashMap<&'static str, &str> = HashMap::new();

        for (key, value) in raw {
            let Some(spec) = self.get(key) else {
                match policy {
                    UnknownOptionPolicy::Reject => {
                        return Err(OptionsError::UnknownOption {
                            kind: self.kind.clone(),
                            key: key.clone(),
                        })
                    }
                    UnknownOptionPolicy::Warn => {
                        warn!(kind = %self.kind, key = %key, "Ignoring unknown option");
                        continue;
                    }
                }
            };

            if let Some(previous) = supplied_as.insert(spec.key, key.as_str()) {
                return Err(OptionsError::InvalidValue {
                    kind: self.kind.clone(),
                    key: spec.key.to_string(),
                    message: format!("'{previous}' and '{key}' both set this option"),
                });
            }

            let coerced = spec
                .ty
                .coerce(value)
                .ok_or_else(|| OptionsError::InvalidOptionType {
                    kind: self.kind.clone(),
                    key: key.clone(),
                    expected: spec.ty.to_string(),
                    found: if spec.sensitive {
                        value.type_name().to_string()
                    } else {
                        format!("{} {}", value.type_name(), value)
                    },
                })?;
            values.insert(spec.key.to_string(), coerced);
        }

        for spec in &self.options {
            if values.contains_key(spec.key) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    values.insert(spec.key.to_string(), default.clone());
                }
                None if spec.required => {
                    return Err(OptionsError::MissingRequiredOption {
                        kind: self.kind.clone(),
                        key: spec.key.to_string(),
                    })
                }
                None => {}
            }
        }

        Ok(OptionsBag::new(self.kind.clone(), values))
    }

    /// Copy of `raw` with sensitive values replaced
    pub fn redact(&self, raw: &RawOptions) -> RawOptions {
        raw.iter()
            .map(|(k, v)| {
                if self.is_sensitive(k) {
                    (k.clone(), OptionValue::from(REDACTED))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }
}
