//! Organization context passed to every stage.

use serde::{Deserialize, Serialize};

/// Opaque identity and profile of the organization being analysed.
///
/// The pipeline never interprets `profile`; it is forwarded to each stage
/// processor as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    /// Stable key used for checkpoints and locking.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Industry, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    /// Arbitrary profile fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub profile: serde_json::Map<String, serde_json::Value>,
}

impl Organization {
    /// Creates an organization with an explicit id.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            industry: None,
            profile: serde_json::Map::new(),
        }
    }

    /// Creates an organization whose id is derived from its name.
    ///
    /// `"Acme Corp"` becomes `"acme-corp"`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(slugify(&name), name)
    }

    /// Sets the industry.
    #[must_use]
    pub fn with_industry(mut self, industry: impl Into<String>) -> Self {
        self.industry = Some(industry.into());
        self
    }

    /// Adds a profile field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.profile.insert(key.into(), value);
        self
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_derives_slug() {
        let org = Organization::named("Acme Corp");
        assert_eq!(org.id, "acme-corp");
        assert_eq!(org.name, "Acme Corp");

        assert_eq!(Organization::named("  Ben & Jerry's  ").id, "ben-jerry-s");
    }

    #[test]
    fn test_profile_fields_serialize() {
        let org = Organization::named("Acme Corp")
            .with_industry("Manufacturing")
            .with_field("employees", serde_json::json!(1200));

        let json = serde_json::to_value(&org).unwrap();
        assert_eq!(json["industry"], "Manufacturing");
        assert_eq!(json["profile"]["employees"], 1200);
    }
}
