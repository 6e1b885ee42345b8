//! Structural (JSON schema) validation of incoming messages.

use jsonschema::error::ValidationError;
use jsonschema::{Retrieve, Uri};
use serde::Serialize;
use serde_json::Value;

use crate::endpoint::Message;
use crate::error::Result;
use crate::{bad_request, interface_method, unexpected};

/// Validate a message against the JSON schema for its `(interface, method)`
/// pair.
pub fn validate(message: &impl Message) -> Result<()> {
    let descriptor = message.descriptor();
    let schema_name = interface_method(&descriptor.interface, &descriptor.method);
    validate_value(&schema_name, message)
}

/// Validate a value against the named JSON schema.
pub fn validate_value<T: Serialize + ?Sized>(schema: &str, value: &T) -> Result<()> {
    let schema_json = precompiled(schema)?;
    let validator = jsonschema::options()
        .with_retriever(Retriever {})
        .build(&schema_json)
        .map_err(|e| unexpected!("issue compiling schema {schema}: {e}"))?;
    let instance =
        serde_json::to_value(value).map_err(|e| unexpected!("issue serializing message: {e}"))?;

    let errors: Vec<ValidationError> = validator.iter_errors(&instance).collect();
    if !errors.is_empty() {
        let mut error = String::new();
        for e in errors {
            error.push_str(&format!("\n - {e} at {}", e.instance_path));
        }
        return Err(bad_request!("validation failed for {schema}: {error}"));
    }

    Ok(())
}

/// Precompiled JSON schemas.
fn precompiled(schema_name: &str) -> Result<Value> {
    match schema_name {
        "records-write" => {
            let schema = include_bytes!("../schemas/records-write.json");
            Ok(serde_json::from_slice(schema)?)
        }
        "records-read" => {
            let schema = include_bytes!("../schemas/records-read.json");
            Ok(serde_json::from_slice(schema)?)
        }
        "records-query" => {
            let schema = include_bytes!("../schemas/records-query.json");
            Ok(serde_json::from_slice(schema)?)
        }
        "records-subscribe" => {
            let schema = include_bytes!("../schemas/records-subscribe.json");
            Ok(serde_json::from_slice(schema)?)
        }
        "records-delete" => {
            let schema = include_bytes!("../schemas/records-delete.json");
            Ok(serde_json::from_slice(schema)?)
        }
        "protocols-configure" => {
            let schema = include_bytes!("../schemas/protocols-configure.json");
            Ok(serde_json::from_slice(schema)?)
        }
        "protocols-query" => {
            let schema = include_bytes!("../schemas/protocols-query.json");
            Ok(serde_json::from_slice(schema)?)
        }
        "permissions-grant" => {
            let schema = include_bytes!("../schemas/permissions-grant.json");
            Ok(serde_json::from_slice(schema)?)
        }
        "permissions-revoke" => {
            let schema = include_bytes!("../schemas/permissions-revoke.json");
            Ok(serde_json::from_slice(schema)?)
        }

        _ => Err(unexpected!("schema not found: {schema_name}")),
    }
}

struct Retriever {}

impl Retrieve for Retriever {
    fn retrieve(
        &self, uri: &Uri<&str>,
    ) -> Result<Value, Box<(dyn std::error::Error + Send + Sync + 'static)>> {
        let Some(file) = uri.path().split('/').last() else {
            return Err(unexpected!("schema not found: {uri}").into());
        };

        match file.as_str() {
            "defs.json" => {
                let schema = include_bytes!("../schemas/defs.json");
                Ok(serde_json::from_slice(schema)?)
            }
            "general-jws.json" => {
                let schema = include_bytes!("../schemas/general-jws.json");
                Ok(serde_json::from_slice(schema)?)
            }
            "records-filter.json" => {
                let schema = include_bytes!("../schemas/records-filter.json");
                Ok(serde_json::from_slice(schema)?)
            }

            _ => Err(unexpected!("schema not found: {uri}").into()),
        }
    }
}
