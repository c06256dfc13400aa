use serde_yaml::{Mapping, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrontmatterError {
    #[error("missing frontmatter, expected a leading `---` line")]
    Missing,
    #[error("frontmatter is not terminated by a `---` line")]
    Unterminated,
    #[error("frontmatter is not a mapping")]
    NotAMapping,
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// YAML block between the leading `---` lines of a markdown document.
#[derive(Debug, Clone, PartialEq)]
pub struct Frontmatter {
    pub fields: Mapping,
    pub body: String,
}

impl Frontmatter {
    pub fn parse(text: &str) -> Result<Frontmatter, FrontmatterError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text.split_inclusive('\n');
        match lines.next() {
            Some(first) if first.trim_end() == "---" => {}
            _ => return Err(FrontmatterError::Missing),
        }

        let mut yaml = String::new();
        let mut terminated = false;
        for line in lines.by_ref() {
            if line.trim_end() == "---" {
                terminated = true;
                break;
            }
            yaml.push_str(line);
        }
        if !terminated {
            return Err(FrontmatterError::Unterminated);
        }
        let body: String = lines.collect();

        let fields = match serde_yaml::from_str::<Value>(&yaml)? {
            Value::Null => Mapping::new(),
            Value::Mapping(fields) => fields,
            _ => return Err(FrontmatterError::NotAMapping),
        };
        Ok(Frontmatter { fields, body })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// String value of `key`; empty strings count as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}
