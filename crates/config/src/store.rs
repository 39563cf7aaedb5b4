//! The schema registry and value store.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::coerce;
use crate::error::ConfigError;

/// Produces a default value.
///
/// Invoked every time an effective value or a dump is computed, so
/// defaults may depend on time or environment. Use [`static_default`] for
/// plain constants.
pub type DefaultProducer = Arc<dyn Fn() -> Value + Send + Sync>;

/// Wraps a constant as a [`DefaultProducer`].
pub fn static_default(value: impl Into<Value>) -> DefaultProducer {
    let value = value.into();
    Arc::new(move || value.clone())
}

/// Value type of a schema key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    String,
    Integer,
    UnsignedInteger,
    Float,
    Boolean,
}

impl ConfigType {
    /// Name used in the `type` member of dumps and previews.
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigType::String => "string",
            ConfigType::Integer => "integer",
            ConfigType::UnsignedInteger => "unsigned integer",
            ConfigType::Float => "float",
            ConfigType::Boolean => "boolean",
        }
    }
}

/// Whether a key must resolve to a non-null effective value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Required,
    Optional,
}

#[derive(Clone)]
struct Entry {
    key: String,
    typ: ConfigType,
    required: bool,
    user_value: Value,
    default: Option<DefaultProducer>,
}

impl Entry {
    fn effective_value(&self) -> Value {
        effective(&self.user_value, self.default.as_ref())
    }

    /// Builds the introspection subdocument for this entry around the
    /// given candidate user value.
    fn doc(&self, user_value: Value) -> Value {
        let mut doc = Map::new();
        let effective_value = effective(&user_value, self.default.as_ref());
        doc.insert("user_value".into(), user_value);
        if let Some(producer) = &self.default {
            doc.insert("default_value".into(), producer());
        }
        doc.insert("effective_value".into(), effective_value);
        doc.insert("type".into(), Value::from(self.typ.as_str()));
        if self.required {
            doc.insert("required".into(), Value::Bool(true));
        }
        Value::Object(doc)
    }
}

fn effective(user_value: &Value, default: Option<&DefaultProducer>) -> Value {
    if user_value.is_null() {
        match default {
            Some(producer) => producer(),
            None => Value::Null,
        }
    } else {
        user_value.clone()
    }
}

/// Schema-validated configuration storage. See the crate documentation
/// for the model and an example.
#[derive(Default, Clone)]
pub struct ConfigStore {
    entries: Vec<Entry>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema key. Entries keep registration order, though
    /// order carries no meaning.
    ///
    /// # Panics
    ///
    /// When `Required` is combined with a default producer: a required
    /// key always has a non-null effective value, making the default
    /// unreachable, so that combination is a schema-definition bug.
    pub fn register_key(
        &mut self,
        key: &str,
        typ: ConfigType,
        requirement: Requirement,
        default: Option<DefaultProducer>,
    ) {
        let required = requirement == Requirement::Required;
        assert!(
            !(required && default.is_some()),
            "config key '{key}' cannot be required and have a default value at the same time"
        );
        self.entries.push(Entry {
            key: key.to_string(),
            typ,
            required,
            user_value: Value::Null,
            default,
        });
    }

    fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    /// Effective value of `key`: the user-supplied value, else the
    /// produced default, else null. Unknown keys are null.
    pub fn get(&self, key: &str) -> Value {
        self.entry(key).map(Entry::effective_value).unwrap_or(Value::Null)
    }

    /// Describes how the store would look with `updates` merged in,
    /// without committing anything, together with any validation errors.
    ///
    /// Unregistered keys in `updates` are omitted from the result; keys
    /// absent from `updates` keep their stored user value. The returned
    /// document has the same shape as [`dump`](Self::dump) and can be
    /// committed with [`force_apply_preview`](Self::force_apply_preview)
    /// once it is known to be error-free.
    pub fn preview_update(&self, updates: &Value) -> (Value, Vec<ConfigError>) {
        let mut errors = Vec::new();
        let updates = match updates {
            Value::Object(map) => Some(map),
            // A null document is an empty update set.
            Value::Null => None,
            _ => {
                errors.push(ConfigError::new("", "The JSON document must be an object"));
                return (self.dump(), errors);
            }
        };

        let mut result = Map::new();
        for entry in &self.entries {
            let user_value = updates
                .and_then(|map| map.get(&entry.key))
                .cloned()
                .unwrap_or_else(|| entry.user_value.clone());
            result.insert(entry.key.clone(), entry.doc(user_value));
        }

        self.validate_required_keys(&result, &mut errors);
        self.validate_value_types(&result, &mut errors);

        (Value::Object(result), errors)
    }

    fn validate_required_keys(&self, preview: &Map<String, Value>, errors: &mut Vec<ConfigError>) {
        for entry in self.entries.iter().filter(|entry| entry.required) {
            let effective = preview.get(&entry.key).and_then(|doc| doc.get("effective_value"));
            if effective.is_none_or(Value::is_null) {
                errors.push(ConfigError::new(&entry.key, "is required"));
            }
        }
    }

    fn validate_value_types(&self, preview: &Map<String, Value>, errors: &mut Vec<ConfigError>) {
        for entry in &self.entries {
            let Some(value) = preview.get(&entry.key).and_then(|doc| doc.get("effective_value"))
            else {
                continue;
            };
            // Null effective values are the required-keys pass's concern.
            if value.is_null() {
                continue;
            }
            if let Some(message) = type_error(entry.typ, value) {
                errors.push(ConfigError::new(&entry.key, message));
            }
        }
    }

    /// Commits a document produced by [`preview_update`](Self::preview_update)
    /// against this store. Performs no validation; only apply previews
    /// that came back without errors.
    pub fn force_apply_preview(&mut self, preview: &Value) {
        for entry in &mut self.entries {
            entry.user_value = preview
                .get(&entry.key)
                .and_then(|doc| doc.get("user_value"))
                .cloned()
                .unwrap_or(Value::Null);
        }
    }

    /// Merges `updates` into the store iff the merged result passes
    /// validation. Returns the update preview on success; on failure the
    /// store is left bitwise unchanged.
    pub fn update(&mut self, updates: &Value) -> Result<Value, Vec<ConfigError>> {
        let (preview, errors) = self.preview_update(updates);
        if errors.is_empty() {
            self.force_apply_preview(&preview);
            Ok(preview)
        } else {
            Err(errors)
        }
    }

    /// Renders every key's user value, produced default, effective value,
    /// type name, and required flag as one JSON object.
    pub fn dump(&self) -> Value {
        let mut result = Map::new();
        for entry in &self.entries {
            result.insert(entry.key.clone(), entry.doc(entry.user_value.clone()));
        }
        Value::Object(result)
    }
}

fn type_error(typ: ConfigType, value: &Value) -> Option<&'static str> {
    match typ {
        ConfigType::String => coerce::to_string_value(value).is_none().then_some("must be a string"),
        ConfigType::Integer => coerce::to_i64(value).is_none().then_some("must be an integer"),
        ConfigType::UnsignedInteger => {
            if coerce::to_u64(value).is_some() {
                None
            } else if coerce::to_i64(value).is_some() {
                Some("must be greater than 0")
            } else {
                Some("must be an integer")
            }
        }
        ConfigType::Float => coerce::to_f64(value).is_none().then_some("must be a number"),
        ConfigType::Boolean => coerce::to_bool(value).is_none().then_some("must be a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coerce;
    use serde_json::json;

    fn sorted_messages(mut errors: Vec<ConfigError>) -> Vec<String> {
        errors.sort();
        errors.iter().map(ConfigError::full_message).collect()
    }

    #[test]
    fn empty_schema_accepts_empty_update() {
        let store = ConfigStore::new();
        let (_, errors) = store.preview_update(&json!({}));
        assert!(errors.is_empty());
    }

    #[test]
    fn empty_schema_accepts_unknown_keys() {
        let store = ConfigStore::new();
        let (_, errors) = store.preview_update(&json!({"foo": "bar"}));
        assert!(errors.is_empty());
    }

    #[test]
    fn non_object_document_rejected() {
        let store = ConfigStore::new();
        let (_, errors) = store.preview_update(&json!("hello"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].full_message(), "The JSON document must be an object");
    }

    #[test]
    fn null_document_is_empty_update() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Optional, None);
        let (_, errors) = store.preview_update(&Value::Null);
        assert!(errors.is_empty());
    }

    #[test]
    fn missing_required_keys_reported() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Required, None);
        store.register_key("bar", ConfigType::String, Requirement::Required, None);

        // An explicit null does not satisfy a required key.
        let (_, errors) = store.preview_update(&json!({"bar": null}));
        let messages = sorted_messages(errors);
        assert_eq!(messages, ["'bar' is required", "'foo' is required"]);
    }

    #[test]
    fn convertible_values_accepted() {
        let mut store = ConfigStore::new();
        store.register_key("string_string", ConfigType::String, Requirement::Required, None);
        store.register_key("string_integer", ConfigType::String, Requirement::Required, None);
        store.register_key("string_real", ConfigType::String, Requirement::Required, None);
        store.register_key("string_boolean", ConfigType::String, Requirement::Required, None);
        store.register_key("integer_integer", ConfigType::Integer, Requirement::Required, None);
        store.register_key("integer_real", ConfigType::Integer, Requirement::Required, None);
        store.register_key("integer_boolean", ConfigType::Integer, Requirement::Required, None);
        store.register_key("integer_signed", ConfigType::Integer, Requirement::Required, None);
        store.register_key(
            "integer_unsigned",
            ConfigType::UnsignedInteger,
            Requirement::Required,
            None,
        );
        store.register_key("float_float", ConfigType::Float, Requirement::Optional, None);
        store.register_key("float_integer", ConfigType::Float, Requirement::Optional, None);
        store.register_key("boolean_boolean", ConfigType::Boolean, Requirement::Required, None);
        store.register_key("boolean_integer", ConfigType::Boolean, Requirement::Required, None);
        store.register_key("boolean_real", ConfigType::Boolean, Requirement::Required, None);

        let updates = json!({
            "string_string": "string",
            "string_integer": 123,
            "string_real": 123.45,
            "string_boolean": true,
            "integer_integer": 123,
            "integer_real": 123.45,
            "integer_boolean": true,
            "integer_signed": -123,
            "integer_unsigned": 123,
            "float_float": 123.45,
            "float_integer": 123,
            "boolean_boolean": true,
            "boolean_integer": 123,
            "boolean_real": 123.45,
        });
        let (_, errors) = store.preview_update(&updates);
        assert_eq!(sorted_messages(errors), Vec::<String>::new());
    }

    #[test]
    fn unconvertible_values_rejected() {
        let mut store = ConfigStore::new();
        store.register_key("integer_string", ConfigType::Integer, Requirement::Required, None);
        store.register_key(
            "integer_unsigned",
            ConfigType::UnsignedInteger,
            Requirement::Required,
            None,
        );
        store.register_key("float_string", ConfigType::Float, Requirement::Optional, None);
        store.register_key("boolean_string", ConfigType::Boolean, Requirement::Required, None);

        let updates = json!({
            "integer_string": "string",
            "integer_unsigned": -123,
            "float_string": "string",
            "boolean_string": "string",
        });
        let (_, errors) = store.preview_update(&updates);
        assert_eq!(
            sorted_messages(errors),
            [
                "'boolean_string' must be a boolean",
                "'float_string' must be a number",
                "'integer_string' must be an integer",
                "'integer_unsigned' must be greater than 0",
            ]
        );
    }

    #[test]
    fn preview_merges_without_mutating() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Required, None);
        store.register_key("bar", ConfigType::Integer, Requirement::Required, None);

        let (preview, errors) = store.preview_update(&json!({"foo": "string", "baz": true}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].full_message(), "'bar' is required");

        assert!(preview.get("foo").is_some());
        assert!(preview.get("bar").is_some());
        assert!(preview.get("baz").is_none());
        assert_eq!(preview["foo"]["user_value"], json!("string"));
        assert!(preview["bar"]["user_value"].is_null());

        // The store itself saw nothing.
        assert!(store.get("foo").is_null());
    }

    #[test]
    fn force_apply_commits_preview_verbatim() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Required, None);
        store.register_key("bar", ConfigType::Integer, Requirement::Required, None);

        let (preview, errors) = store.preview_update(&json!({"foo": "string", "baz": true}));
        assert_eq!(errors.len(), 1);

        store.force_apply_preview(&preview);
        assert_eq!(store.get("foo"), json!("string"));
        assert!(store.get("bar").is_null());
    }

    #[test]
    fn failed_update_leaves_store_unchanged() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Required, None);
        store.register_key("bar", ConfigType::Integer, Requirement::Optional, None);
        store.update(&json!({"foo": "before", "bar": 1})).unwrap();

        let before = store.dump();
        let errors = store.update(&json!({"foo": "after", "bar": "oops"})).unwrap_err();
        assert_eq!(errors[0].full_message(), "'bar' must be an integer");
        assert_eq!(store.dump(), before);
    }

    #[test]
    fn partial_updates_keep_other_keys() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Required, None);
        store.register_key("bar", ConfigType::Float, Requirement::Optional, None);

        store.update(&json!({"foo": "strval"})).unwrap();
        store.update(&json!({"bar": 123.45})).unwrap();
        assert_eq!(store.get("foo"), json!("strval"));
        assert_eq!(store.get("bar"), json!(123.45));
    }

    #[test]
    fn unknown_keys_never_stored() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Required, None);
        store.update(&json!({"foo": "strval", "unknown": true})).unwrap();

        assert!(store.get("unknown").is_null());
        assert!(store.dump().get("unknown").is_none());
    }

    #[test]
    fn null_assignment_clears_a_key() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Optional, None);
        store.update(&json!({"foo": "strval"})).unwrap();
        assert_eq!(store.get("foo"), json!("strval"));

        store.update(&json!({"foo": null})).unwrap();
        assert!(store.get("foo").is_null());
    }

    #[test]
    fn integer_values_truncate_on_read() {
        let mut store = ConfigStore::new();
        store.register_key("bar", ConfigType::Integer, Requirement::Optional, None);
        store.update(&json!({"bar": 123.45})).unwrap();
        assert_eq!(coerce::to_i64(&store.get("bar")), Some(123));
    }

    #[test]
    fn dump_shows_user_and_effective_values() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Required, None);
        store.register_key("bar", ConfigType::Integer, Requirement::Required, None);
        store.update(&json!({"foo": "string", "bar": 123})).unwrap();

        let dump = store.dump();
        assert_eq!(dump["foo"]["user_value"], json!("string"));
        assert_eq!(dump["foo"]["effective_value"], json!("string"));
        assert_eq!(dump["foo"]["type"], json!("string"));
        assert_eq!(dump["foo"]["required"], json!(true));
        assert!(dump["foo"].get("default_value").is_none());
        assert_eq!(dump["bar"]["user_value"], json!(123));
        assert_eq!(dump["bar"]["effective_value"], json!(123));
        assert_eq!(dump["bar"]["type"], json!("integer"));
    }

    #[test]
    fn optional_flag_omitted_from_dump() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::UnsignedInteger, Requirement::Optional, None);
        let dump = store.dump();
        assert!(dump["foo"].get("required").is_none());
        assert_eq!(dump["foo"]["type"], json!("unsigned integer"));
    }

    #[test]
    fn default_values_produce_effective_values() {
        let mut store = ConfigStore::new();
        store.register_key(
            "foo",
            ConfigType::String,
            Requirement::Optional,
            Some(static_default("string")),
        );
        store.register_key(
            "bar",
            ConfigType::Integer,
            Requirement::Optional,
            Some(static_default(123)),
        );

        assert_eq!(store.get("foo"), json!("string"));
        assert_eq!(store.get("bar"), json!(123));

        let dump = store.dump();
        assert!(dump["foo"]["user_value"].is_null());
        assert_eq!(dump["foo"]["default_value"], json!("string"));
        assert_eq!(dump["foo"]["effective_value"], json!("string"));
        assert!(dump["bar"]["user_value"].is_null());
        assert_eq!(dump["bar"]["default_value"], json!(123));
        assert_eq!(dump["bar"]["effective_value"], json!(123));
    }

    #[test]
    fn user_value_overrides_default() {
        let mut store = ConfigStore::new();
        store.register_key(
            "bar",
            ConfigType::Integer,
            Requirement::Optional,
            Some(static_default(123)),
        );
        store.update(&json!({"bar": 456})).unwrap();
        assert_eq!(store.get("bar"), json!(456));

        // Clearing the user value falls back to the default.
        store.update(&json!({"bar": null})).unwrap();
        assert_eq!(store.get("bar"), json!(123));
    }

    #[test]
    fn dynamic_default_invoked_per_read() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let counter = Arc::new(AtomicI64::new(0));
        let mut store = ConfigStore::new();
        let producer_counter = Arc::clone(&counter);
        store.register_key(
            "ticks",
            ConfigType::Integer,
            Requirement::Optional,
            Some(Arc::new(move || {
                Value::from(producer_counter.fetch_add(1, Ordering::SeqCst))
            })),
        );

        assert_eq!(store.get("ticks"), json!(0));
        assert_eq!(store.get("ticks"), json!(1));
        // A dump produces both the default and the effective value.
        store.dump();
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn empty_preview_round_trips() {
        let mut store = ConfigStore::new();
        store.register_key("foo", ConfigType::String, Requirement::Required, None);
        store.register_key(
            "bar",
            ConfigType::Integer,
            Requirement::Optional,
            Some(static_default(123)),
        );
        store.update(&json!({"foo": "strval"})).unwrap();

        let before = store.dump();
        let (preview, _) = store.preview_update(&json!({}));
        store.force_apply_preview(&preview);
        assert_eq!(store.dump(), before);
    }

    #[test]
    #[should_panic(expected = "required and have a default value")]
    fn required_key_with_default_is_rejected() {
        let mut store = ConfigStore::new();
        store.register_key(
            "foo",
            ConfigType::String,
            Requirement::Required,
            Some(static_default("x")),
        );
    }
}
