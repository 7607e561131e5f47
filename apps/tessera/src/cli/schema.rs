//! # Schema Files
//!
//! Class metadata for the CLI, read from TOML:
//!
//! ```toml
//! [[classes]]
//! name = "app.Person"
//! versioned = true
//!
//! [[classes.fields]]
//! name = "name"
//!
//! [[classes.fields]]
//! name = "friend"
//! shape = "reference"
//! target = "app.Person"
//!
//! [[classes]]
//! name = "app.Country"
//! key = ["code"]
//!
//! [[classes.fields]]
//! name = "code"
//! ```
//!
//! Container fields name their persistable element class in `element`
//! (maps: `key` and `value`); leaving it out means plain values.

use serde::Deserialize;
use std::path::Path;
use tessera_core::{
    ClassDescriptor, ElementKind, FieldDescriptor, FieldShape, MetadataRegistry, TesseraError,
};

/// Top level of a schema file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchemaFile {
    /// Declared classes.
    pub classes: Vec<ClassSpec>,
}

/// One class of a schema file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassSpec {
    /// Fully qualified class name.
    pub name: String,
    /// Direct superclass.
    #[serde(default)]
    pub superclass: Option<String>,
    /// Track record versions.
    #[serde(default)]
    pub versioned: bool,
    /// Application key fields; empty for store-assigned identity.
    #[serde(default)]
    pub key: Vec<String>,
    /// Fields in declaration order.
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// Shape keyword of a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    #[default]
    Scalar,
    Reference,
    Collection,
    Map,
    Array,
}

/// One field of a schema class.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub shape: ShapeKind,
    /// Referenced class (`reference`).
    #[serde(default)]
    pub target: Option<String>,
    /// Persistable element class (`collection`, `array`).
    #[serde(default)]
    pub element: Option<String>,
    /// Persistable key class (`map`).
    #[serde(default)]
    pub key: Option<String>,
    /// Persistable value class (`map`).
    #[serde(default)]
    pub value: Option<String>,
    /// Delete referenced objects together with the owner.
    #[serde(default)]
    pub dependent: bool,
}

fn element_kind(class: Option<&String>) -> ElementKind {
    class.map_or(ElementKind::Scalar, |c| ElementKind::Persistable(c.clone()))
}

impl FieldSpec {
    fn descriptor(&self, class: &str) -> Result<FieldDescriptor, TesseraError> {
        let shape = match self.shape {
            ShapeKind::Scalar => FieldShape::Scalar,
            ShapeKind::Reference => {
                let target = self.target.clone().ok_or_else(|| {
                    TesseraError::InvalidConfig(format!(
                        "reference field {}.{} needs a target class",
                        class, self.name
                    ))
                })?;
                FieldShape::Reference { target }
            }
            ShapeKind::Collection => FieldShape::Collection {
                element: element_kind(self.element.as_ref()),
            },
            ShapeKind::Array => FieldShape::Array {
                element: element_kind(self.element.as_ref()),
            },
            ShapeKind::Map => FieldShape::Map {
                key: element_kind(self.key.as_ref()),
                value: element_kind(self.value.as_ref()),
            },
        };
        let field = FieldDescriptor::with_shape(&self.name, shape);
        Ok(if self.dependent { field.dependent() } else { field })
    }
}

impl ClassSpec {
    /// Build the class descriptor.
    pub fn descriptor(&self) -> Result<ClassDescriptor, TesseraError> {
        let mut class = ClassDescriptor::new(&self.name);
        if let Some(superclass) = &self.superclass {
            class = class.extends(superclass);
        }
        if self.versioned {
            class = class.versioned();
        }
        if !self.key.is_empty() {
            class = class.application_identity(self.key.iter().cloned());
        }
        for field in &self.fields {
            class = class.field(field.descriptor(&self.name)?);
        }
        Ok(class)
    }
}

impl SchemaFile {
    /// Parse schema TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, TesseraError> {
        toml::from_str(text).map_err(|e| TesseraError::InvalidConfig(e.to_string()))
    }

    /// Register every class, checking that superclasses and referenced
    /// classes are declared too.
    pub fn registry(&self) -> Result<MetadataRegistry, TesseraError> {
        let mut registry = MetadataRegistry::new();
        for class in &self.classes {
            registry.register(class.descriptor()?)?;
        }
        for class in registry.classes() {
            let referenced = class
                .superclass
                .iter()
                .map(String::as_str)
                .chain(class.fields.iter().flat_map(|f| referenced_classes(&f.shape)));
            for name in referenced {
                if !registry.contains(name) {
                    return Err(TesseraError::InvalidConfig(format!(
                        "class {} refers to undeclared class {}",
                        class.name, name
                    )));
                }
            }
        }
        tracing::debug!(classes = self.classes.len(), "schema loaded");
        Ok(registry)
    }
}

fn referenced_classes(shape: &FieldShape) -> Vec<&str> {
    match shape {
        FieldShape::Scalar => Vec::new(),
        FieldShape::Reference { target } => vec![target.as_str()],
        FieldShape::Collection { element } | FieldShape::Array { element } => {
            element.persistable_class().into_iter().collect()
        }
        FieldShape::Map { key, value } => key
            .persistable_class()
            .into_iter()
            .chain(value.persistable_class())
            .collect(),
    }
}

/// Metadata from `path`, or an empty registry when no schema is given.
pub fn load_schema(path: Option<&Path>) -> Result<MetadataRegistry, TesseraError> {
    let Some(path) = path else {
        return Ok(MetadataRegistry::new());
    };
    let text = std::fs::read_to_string(path).map_err(|e| {
        TesseraError::IoError(format!("cannot read schema '{}': {}", path.display(), e))
    })?;
    SchemaFile::from_toml_str(&text)?.registry()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::IdentityStrategy;

    const SCHEMA: &str = r#"
        [[classes]]
        name = "app.Person"
        versioned = true

        [[classes.fields]]
        name = "name"

        [[classes.fields]]
        name = "friend"
        shape = "reference"
        target = "app.Person"

        [[classes]]
        name = "app.Team"

        [[classes.fields]]
        name = "members"
        shape = "collection"
        element = "app.Person"
        dependent = true

        [[classes.fields]]
        name = "roles"
        shape = "map"
        value = "app.Person"

        [[classes]]
        name = "app.Country"
        key = ["code"]

        [[classes.fields]]
        name = "code"
    "#;

    #[test]
    fn schema_builds_descriptors() {
        let registry = SchemaFile::from_toml_str(SCHEMA)
            .expect("parse")
            .registry()
            .expect("registry");

        let person = registry.get("app.Person").expect("person");
        assert!(person.versioned);
        assert_eq!(
            person.fields[1].shape,
            FieldShape::Reference {
                target: "app.Person".into()
            }
        );

        let team = registry.get("app.Team").expect("team");
        assert!(team.fields[0].dependent);
        assert_eq!(
            team.fields[1].shape,
            FieldShape::Map {
                key: ElementKind::Scalar,
                value: ElementKind::Persistable("app.Person".into())
            }
        );

        let country = registry.get("app.Country").expect("country");
        assert_eq!(
            country.identity,
            IdentityStrategy::Application {
                key_fields: vec!["code".into()]
            }
        );
    }

    #[test]
    fn reference_without_target_is_rejected() {
        let schema = SchemaFile::from_toml_str(
            r#"
            [[classes]]
            name = "a.A"
            [[classes.fields]]
            name = "b"
            shape = "reference"
            "#,
        )
        .expect("parse");
        assert!(matches!(schema.registry(), Err(TesseraError::InvalidConfig(_))));
    }

    #[test]
    fn undeclared_superclass_is_rejected() {
        let schema = SchemaFile::from_toml_str(
            r#"
            [[classes]]
            name = "a.B"
            superclass = "a.A"
            "#,
        )
        .expect("parse");
        assert!(matches!(schema.registry(), Err(TesseraError::InvalidConfig(_))));
    }

    #[test]
    fn missing_schema_is_empty() {
        assert_eq!(load_schema(None).expect("empty").classes().count(), 0);
    }
}
