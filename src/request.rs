//! Container request boundary
//!
//! Requests arrive from an external event/relation layer as loose records of
//! the shape `{unit: "service/N", image: "reference"}`. This module validates
//! them at the boundary so everything past it works with well-formed data.

use crate::error::{BerthError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single desired-state request for one (service, unit) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    /// Requesting unit, e.g. "web/0"
    pub unit: String,
    /// Image reference the unit wants running, e.g. "nginx:1.21"
    pub image: String,
}

impl ContainerRequest {
    /// Create a new container request
    pub fn new(unit: &str, image: &str) -> Self {
        Self {
            unit: unit.to_string(),
            image: image.to_string(),
        }
    }

    /// Parse a request from a loose JSON record, failing fast on missing or
    /// empty fields
    pub fn from_value(value: &Value) -> Result<Self> {
        let unit = value
            .get("unit")
            .and_then(Value::as_str)
            .ok_or_else(|| BerthError::MalformedRequest("missing field 'unit'".to_string()))?;
        let image = value
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| BerthError::MalformedRequest("missing field 'image'".to_string()))?;

        let request = Self::new(unit, image);
        request.validate()?;
        Ok(request)
    }

    /// Check that both fields are present and the unit is splittable
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(BerthError::MalformedRequest(format!(
                "empty image reference for unit '{}'",
                self.unit
            )));
        }
        self.identity().map(|_| ())
    }

    /// Derive the (service, unit_id) identity from the unit string
    pub fn identity(&self) -> Result<ServiceUnit> {
        ServiceUnit::parse(&self.unit)
    }
}

/// Identity of one requested container: a service namespace plus an instance
/// discriminator within it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceUnit {
    /// Service name, e.g. "web"
    pub service: String,
    /// Unit discriminator within the service, e.g. "0"
    pub unit_id: String,
}

impl ServiceUnit {
    /// Create a new service unit identity
    pub fn new(service: &str, unit_id: &str) -> Self {
        Self {
            service: service.to_string(),
            unit_id: unit_id.to_string(),
        }
    }

    /// Split a unit string of the form "service/N" on the first '/'
    pub fn parse(unit: &str) -> Result<Self> {
        let (service, unit_id) = unit.split_once('/').ok_or_else(|| {
            BerthError::MalformedRequest(format!("unit '{}' is not of the form service/N", unit))
        })?;

        if service.is_empty() || unit_id.is_empty() {
            return Err(BerthError::MalformedRequest(format!(
                "unit '{}' has an empty service or unit id",
                unit
            )));
        }

        Ok(Self::new(service, unit_id))
    }

    /// Identity label key for runtime queries
    pub fn label_key(&self) -> &str {
        &self.service
    }

    /// Identity label value for runtime queries
    pub fn label_value(&self) -> &str {
        &self.unit_id
    }

    /// Full "service=unit_id" label used to filter containers
    pub fn label(&self) -> String {
        format!("{}={}", self.service, self.unit_id)
    }
}

impl std::fmt::Display for ServiceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.unit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_unit() {
        let su = ServiceUnit::parse("web/0").unwrap();
        assert_eq!(su.service, "web");
        assert_eq!(su.unit_id, "0");
        assert_eq!(su.label(), "web=0");
    }

    #[test]
    fn test_parse_unit_splits_on_first_slash() {
        let su = ServiceUnit::parse("app/1/extra").unwrap();
        assert_eq!(su.service, "app");
        assert_eq!(su.unit_id, "1/extra");
    }

    #[test]
    fn test_parse_unit_without_slash_fails() {
        let result = ServiceUnit::parse("web");
        assert!(matches!(result, Err(BerthError::MalformedRequest(_))));
    }

    #[test]
    fn test_parse_unit_empty_parts_fail() {
        assert!(ServiceUnit::parse("/0").is_err());
        assert!(ServiceUnit::parse("web/").is_err());
    }

    #[test]
    fn test_from_value() {
        let value = json!({"unit": "web/0", "image": "nginx:1.21"});
        let request = ContainerRequest::from_value(&value).unwrap();
        assert_eq!(request.unit, "web/0");
        assert_eq!(request.image, "nginx:1.21");
    }

    #[test]
    fn test_from_value_missing_fields() {
        assert!(ContainerRequest::from_value(&json!({"unit": "web/0"})).is_err());
        assert!(ContainerRequest::from_value(&json!({"image": "nginx"})).is_err());
    }

    #[test]
    fn test_empty_image_is_malformed() {
        let request = ContainerRequest::new("web/0", "  ");
        assert!(matches!(
            request.validate(),
            Err(BerthError::MalformedRequest(_))
        ));
    }
}
