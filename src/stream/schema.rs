//! Entry-type schema advertisement.
//!
//! There is no runtime reflection here: entry types carry a hand-written
//! descriptor (type name plus per-language description strings), and the
//! stream captures the resulting `StreamSchema` once at construction.

use std::collections::BTreeMap;

use serde::Serialize;

/// Hand-written schema descriptor for a stream entry type.
///
/// The defaults advertise the bare Rust type name under the `"rust"`
/// language tag; entry types with a wire contract worth documenting
/// override `describe_languages`.
pub trait DescribeSchema {
    fn schema_type_name() -> String
    where
        Self: Sized,
    {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    fn describe_languages() -> BTreeMap<String, String>
    where
        Self: Sized,
    {
        BTreeMap::from([("rust".to_string(), Self::schema_type_name())])
    }
}

impl DescribeSchema for String {}
impl DescribeSchema for u32 {}
impl DescribeSchema for u64 {}
impl DescribeSchema for i64 {}

/// The schema a stream advertises over HTTP, precomputed at construction.
#[derive(Clone, Debug, Serialize)]
pub struct StreamSchema {
    pub type_name: String,
    pub language: BTreeMap<String, String>,
}

impl StreamSchema {
    pub fn of<E: DescribeSchema>() -> Self {
        Self {
            type_name: E::schema_type_name(),
            language: E::describe_languages(),
        }
    }

    pub fn for_language(&self, language: &str) -> Option<&str> {
        self.language.get(language).map(String::as_str)
    }
}

/// Body of the `404` returned for an unknown schema language.
#[derive(Clone, Debug, Serialize)]
pub struct SchemaFormatNotFound {
    pub error: String,
    pub unsupported_format_requested: Option<String>,
}

impl SchemaFormatNotFound {
    pub fn new(requested: impl Into<String>) -> Self {
        Self {
            error: "Unsupported schema format requested.".to_string(),
            unsupported_format_requested: Some(requested.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Custom;

    impl DescribeSchema for Custom {
        fn describe_languages() -> BTreeMap<String, String> {
            BTreeMap::from([
                ("rust".to_string(), "struct Custom;".to_string()),
                ("markdown".to_string(), "# Custom".to_string()),
            ])
        }
    }

    #[test]
    fn default_descriptor_uses_bare_type_name() {
        let schema = StreamSchema::of::<String>();
        assert_eq!(schema.type_name, "String");
        assert_eq!(schema.for_language("rust"), Some("String"));
        assert_eq!(schema.for_language("haskell"), None);
    }

    #[test]
    fn custom_descriptor_lists_all_languages() {
        let schema = StreamSchema::of::<Custom>();
        assert_eq!(schema.for_language("markdown"), Some("# Custom"));
        assert_eq!(schema.language.len(), 2);
    }
}
