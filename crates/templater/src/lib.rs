//! Text template rendering.
//!
//! [`render_text`] parses a template, registers the caller's [`FuncMap`] and
//! renders it against any `Serialize` value:
//!
//! ```rust
//! use utilkit_templater::{render_text, FuncMap};
//!
//! let mut funcs = FuncMap::new();
//! funcs.insert_str_fn("ToUpper", |s| s.to_uppercase());
//!
//! let out = render_text("greeting", "hello, {{ data | ToUpper }}!", "world", &funcs).unwrap();
//! assert_eq!(out, b"hello, WORLD!");
//! ```

mod error;

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::value::{Rest, ValueKind};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde::Serialize;

pub use error::{Result, TemplateError};
pub use minijinja::Value;

/// Name under which the render data is always reachable.
pub const DATA_VAR: &str = "data";

/// A template function. Receives all arguments (for a filter, the piped value
/// first) and returns a value or an error message.
pub type TemplateFn = Arc<dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync>;

/// Named functions made available to a template, both as filters
/// (`{{ x | name }}`) and as calls (`{{ name(x) }}`).
#[derive(Clone, Default)]
pub struct FuncMap {
    funcs: BTreeMap<String, TemplateFn>,
}

impl FuncMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.funcs.insert(name.into(), Arc::new(f));
        self
    }

    /// Register a string to string function applied to the first argument.
    pub fn insert_str_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let name = name.into();
        let fn_name = name.clone();
        self.insert(name, move |args: &[Value]| {
            let first = args
                .first()
                .ok_or_else(|| format!("{fn_name} expects one argument"))?;
            let text = match first.as_str() {
                Some(s) => s.to_string(),
                None => first.to_string(),
            };
            Ok(Value::from(f(&text)))
        })
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    fn register(&self, env: &mut Environment<'_>) {
        for (name, f) in &self.funcs {
            let filter = Arc::clone(f);
            env.add_filter(name.clone(), move |args: Rest<Value>| call(&filter, &args));
            let function = Arc::clone(f);
            env.add_function(name.clone(), move |args: Rest<Value>| call(&function, &args));
        }
    }
}

impl std::fmt::Debug for FuncMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.funcs.keys()).finish()
    }
}

fn call(f: &TemplateFn, args: &[Value]) -> std::result::Result<Value, minijinja::Error> {
    f(args).map_err(|msg| minijinja::Error::new(ErrorKind::InvalidOperation, msg))
}

/// Render `text` (registered as template `name`) with `data` and `funcs`.
///
/// `data` is available as `data`; when it serializes to a map its entries are
/// also top-level variables. Undefined variables are errors, and a trailing
/// newline in the template is kept.
pub fn render_text<S: Serialize>(
    name: &str,
    text: &str,
    data: S,
    funcs: &FuncMap,
) -> Result<Vec<u8>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    funcs.register(&mut env);
    env.add_template(name, text)?;

    let template = env.get_template(name)?;
    let rendered = template.render(build_context(Value::from_serialize(&data))?)?;
    tracing::trace!("rendered template {name} ({} bytes)", rendered.len());
    Ok(rendered.into_bytes())
}

fn build_context(root: Value) -> Result<BTreeMap<String, Value>> {
    let mut ctx = BTreeMap::new();
    if root.kind() == ValueKind::Map {
        for key in root.try_iter()? {
            let item = root.get_item(&key)?;
            ctx.insert(key.to_string(), item);
        }
    }
    ctx.insert(DATA_VAR.to_string(), root);
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_upper() -> FuncMap {
        let mut funcs = FuncMap::new();
        funcs.insert_str_fn("ToUpper", |s| s.to_uppercase());
        funcs
    }

    #[test]
    fn test_render_with_filter() {
        let out = render_text("_", "hello, {{ data | ToUpper }}!", "world", &to_upper()).unwrap();
        assert_eq!(out, b"hello, WORLD!".to_vec());
    }

    #[test]
    fn test_render_function_call_syntax() {
        let out = render_text("_", "{{ ToUpper(data) }}", "abc", &to_upper()).unwrap();
        assert_eq!(out, b"ABC".to_vec());
    }

    #[test]
    fn test_map_fields_are_top_level() {
        let data = json!({ "name": "kafka", "port": 9092 });
        let out = render_text(
            "conn",
            "{{ name }}:{{ port }} ({{ data.name }})",
            &data,
            &FuncMap::new(),
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "kafka:9092 (kafka)");
    }

    #[test]
    fn test_variadic_function() {
        let mut funcs = FuncMap::new();
        funcs.insert("join", |args: &[Value]| {
            Ok(Value::from(
                args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("-"),
            ))
        });
        let out = render_text("_", "{{ join(1, 2, 3) }}", (), &funcs).unwrap();
        assert_eq!(out, b"1-2-3".to_vec());
    }

    #[test]
    fn test_function_error_is_reported() {
        let mut funcs = FuncMap::new();
        funcs.insert("fail", |_args: &[Value]| Err("boom".to_string()));
        let err = render_text("_", "{{ fail() }}", (), &funcs).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_parse_error() {
        let err = render_text("broken", "{{ data ", "x", &FuncMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Template(_)));
    }

    #[test]
    fn test_undefined_variable_is_error() {
        let err = render_text("_", "{{ missing }}", json!({}), &FuncMap::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_trailing_newline_kept() {
        let out = render_text("_", "line\n", (), &FuncMap::new()).unwrap();
        assert_eq!(out, b"line\n".to_vec());
    }

    #[test]
    fn test_funcmap_debug_lists_names() {
        let funcs = to_upper();
        assert_eq!(format!("{funcs:?}"), "{\"ToUpper\"}");
        assert_eq!(funcs.len(), 1);
    }
}
