//! Schema runner behind the `mop-inspect` binary.

pub mod schema;

use std::sync::Arc;

use mop_runtime::{
    Dispatcher, HookKind, Implementation, ObjectRef, RecordingObserver, RuntimeConfig, Target,
    TypeId, Value,
};
use serde::Serialize;
use tracing::{debug, info};

pub use schema::{Schema, SchemaError};

/// Outcome of one schema call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallReport {
    pub call: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub calls: Vec<CallReport>,
    /// Mixin conflict warnings, rendered.
    pub warnings: Vec<String>,
    /// Trace events, rendered; empty unless requested.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}

/// Build a dispatcher from `schema`, run its calls and report.
pub fn run(schema: &Schema, config: RuntimeConfig, with_trace: bool) -> Result<Report, SchemaError> {
    let dispatcher = Dispatcher::new(config);
    let recorder = Arc::new(RecordingObserver::new());
    if with_trace {
        dispatcher.add_observer(recorder.clone());
    }

    for decl in &schema.types {
        let supertypes = decl
            .supertypes
            .iter()
            .map(|name| resolve_type(&dispatcher, name))
            .collect::<Result<Vec<_>, _>>()?;
        let id = dispatcher.declare_type(&decl.name, &supertypes)?;
        debug!(type_name = %decl.name, id = id.0, "declared type");
    }

    for decl in &schema.methods {
        let ty = resolve_type(&dispatcher, &decl.type_name)?;
        let params = decl
            .params
            .iter()
            .map(|name| resolve_type(&dispatcher, name))
            .collect::<Result<Vec<_>, _>>()?;
        let imp = Implementation::constant(to_value(&decl.returns)?);
        if decl.dynamic {
            dispatcher.add_dynamic_method(&Target::Type(ty), &decl.name, &params, imp)?;
        } else {
            dispatcher.register_native_method(ty, &decl.name, &params, imp, false)?;
        }
    }

    for decl in &schema.properties {
        let ty = resolve_type(&dispatcher, &decl.type_name)?;
        let getter = Implementation::constant(to_value(&decl.value)?);
        dispatcher.register_property(ty, &decl.name, Some(getter), None)?;
    }

    for decl in &schema.hooks {
        let ty = resolve_type(&dispatcher, &decl.type_name)?;
        let kind = match decl.kind.as_str() {
            "method_missing" => HookKind::MethodMissing,
            "property_missing" => HookKind::PropertyMissing,
            other => return Err(SchemaError::UnknownHook(other.to_string())),
        };
        let template = decl.returns.clone();
        let hook = Implementation::native(move |_, args| {
            let name = args.first().map(Value::to_string).unwrap_or_default();
            Ok(Value::from(template.replace("{name}", &name)))
        });
        dispatcher.set_hook(ty, kind, hook)?;
    }

    let mut warnings = Vec::new();
    for decl in &schema.mixins {
        let target = resolve_type(&dispatcher, &decl.target)?;
        let source = resolve_type(&dispatcher, &decl.source)?;
        for warning in dispatcher.install_mixin(target, source)? {
            warnings.push(format!(
                "{} replaces `{}` on {}",
                decl.source, warning.member, decl.target
            ));
        }
    }

    let mut calls = Vec::with_capacity(schema.calls.len());
    for decl in &schema.calls {
        let receiver = ObjectRef::new(resolve_type(&dispatcher, &decl.receiver)?);
        let args = decl
            .args
            .iter()
            .map(|arg| to_arg(&dispatcher, arg))
            .collect::<Result<Vec<_>, _>>()?;
        let rendered = format!(
            "{}.{}({})",
            decl.receiver,
            decl.member,
            args.iter().map(Value::to_string).collect::<Vec<_>>().join(", ")
        );

        let report = match dispatcher.dispatch(receiver, &decl.member, args, decl.property) {
            Ok(value) => CallReport {
                call: rendered,
                result: Some(to_json(&value)),
                error: None,
            },
            Err(err) => CallReport {
                call: rendered,
                result: None,
                error: Some(err.to_string()),
            },
        };
        calls.push(report);
    }
    info!(calls = calls.len(), warnings = warnings.len(), "schema run complete");

    let trace = recorder.drain().iter().map(|e| format!("{:?}", e)).collect();
    Ok(Report {
        calls,
        warnings,
        trace,
    })
}

fn resolve_type(dispatcher: &Dispatcher, name: &str) -> Result<TypeId, SchemaError> {
    dispatcher
        .registry()
        .lookup_name(name)
        .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
}

fn to_value(value: &toml::Value) -> Result<Value, SchemaError> {
    match value {
        toml::Value::String(s) => Ok(Value::from(s.as_str())),
        toml::Value::Integer(i) => Ok(Value::Int(*i)),
        toml::Value::Float(f) => Ok(Value::Double(*f)),
        toml::Value::Boolean(b) => Ok(Value::Bool(*b)),
        other => Err(SchemaError::UnsupportedValue(other.to_string())),
    }
}

/// Call arguments may also be `{ new = "Type" }` for a fresh object.
fn to_arg(dispatcher: &Dispatcher, value: &toml::Value) -> Result<Value, SchemaError> {
    if let Some(name) = value.get("new").and_then(toml::Value::as_str) {
        return Ok(Value::from(ObjectRef::new(resolve_type(dispatcher, name)?)));
    }
    to_value(value)
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Double(d) => serde_json::Value::from(*d),
        Value::Str(s) => serde_json::Value::from(&**s),
        Value::Object(_) => serde_json::Value::String(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const ZOO: &str = r#"
        [[types]]
        name = "Animal"

        [[types]]
        name = "Dog"
        supertypes = ["Animal"]

        [[types]]
        name = "Loud"

        [[methods]]
        type = "Animal"
        name = "speak"
        returns = "..."

        [[methods]]
        type = "Animal"
        name = "speak"
        returns = "Woof"
        dynamic = true

        [[methods]]
        type = "Animal"
        name = "sum"
        params = ["Int", "Int"]
        returns = "int"

        [[methods]]
        type = "Animal"
        name = "sum"
        params = ["Number", "Number"]
        returns = "number"

        [[methods]]
        type = "Loud"
        name = "shout"
        returns = "HEY"

        [[hooks]]
        type = "Animal"
        kind = "method_missing"
        returns = "handled:{name}"

        [[mixins]]
        target = "Dog"
        source = "Loud"

        [[calls]]
        receiver = "Dog"
        member = "speak"

        [[calls]]
        receiver = "Dog"
        member = "sum"
        args = [1.5, 2]

        [[calls]]
        receiver = "Dog"
        member = "shout"

        [[calls]]
        receiver = "Dog"
        member = "bark"
    "#;

    #[test]
    fn test_run_zoo_schema() {
        let schema = Schema::from_toml_str(ZOO).unwrap();
        let report = run(&schema, RuntimeConfig::default(), false).unwrap();

        let results: Vec<_> = report.calls.iter().map(|c| c.result.clone()).collect();
        assert_eq!(
            results,
            vec![
                Some(serde_json::json!("Woof")),
                Some(serde_json::json!("number")),
                Some(serde_json::json!("HEY")),
                Some(serde_json::json!("handled:bark")),
            ]
        );
        assert_eq!(report.calls[1].call, "Dog.sum(1.5, 2)");
        assert!(report.warnings.is_empty());
        assert!(report.trace.is_empty());
    }

    #[test]
    fn test_missing_member_reported_not_fatal() {
        let schema = Schema::from_toml_str(
            r#"
            [[types]]
            name = "Rock"

            [[calls]]
            receiver = "Rock"
            member = "speak"
            "#,
        )
        .unwrap();
        let report = run(&schema, RuntimeConfig::default(), true).unwrap();

        assert!(report.calls[0].result.is_none());
        assert!(report.calls[0].error.as_deref().unwrap().contains("`speak`"));
        assert_eq!(report.trace.len(), 1);
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let schema = Schema::from_toml_str(
            r#"
            [[calls]]
            receiver = "Ghost"
            member = "boo"
            "#,
        )
        .unwrap();
        let err = run(&schema, RuntimeConfig::default(), false).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownType(name) if name == "Ghost"));
    }

    #[test]
    fn test_duplicate_native_signature_is_a_conflict() {
        let schema = Schema::from_toml_str(
            r#"
            [[types]]
            name = "Animal"

            [[methods]]
            type = "Animal"
            name = "speak"
            returns = "first"

            [[methods]]
            type = "Animal"
            name = "speak"
            returns = "second"
            "#,
        )
        .unwrap();
        let err = run(&schema, RuntimeConfig::default(), false).unwrap_err();
        match err {
            SchemaError::Registry(mop_runtime::RegistryError::Conflict(conflict)) => {
                assert_eq!(conflict.type_name, "Animal");
            }
            other => panic!("Expected a registration conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_object_arguments() {
        let schema = Schema::from_toml_str(
            r#"
            [[types]]
            name = "Animal"

            [[types]]
            name = "Vet"

            [[methods]]
            type = "Vet"
            name = "treat"
            params = ["Animal"]
            returns = "treated"

            [[calls]]
            receiver = "Vet"
            member = "treat"
            args = [{ new = "Animal" }]
            "#,
        )
        .unwrap();
        let report = run(&schema, RuntimeConfig::default(), false).unwrap();
        assert_eq!(report.calls[0].result, Some(serde_json::json!("treated")));
    }

    #[test]
    fn test_load_schema_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ZOO.as_bytes()).unwrap();

        let schema = Schema::load(file.path()).unwrap();
        assert_eq!(schema.calls.len(), 4);
        assert_eq!(schema.mixins[0].source, "Loud");
    }
}
