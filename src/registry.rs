//! Static tool table and the single decode-and-validate step every
//! `tools/call` goes through before a backend sees it.

use crate::protocol::ProtocolError;
use crate::sandbox::PathSandbox;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
	String,
	Number,
	Integer,
	Boolean,
	Array,
	Object,
}

/// How a path argument is confined before the backend receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
	/// Every component symlink-resolved.
	Resolved,
	/// Parent resolved, final component kept literally so a symlink names
	/// the link itself.
	Entry,
}

#[derive(Debug, Clone, Serialize)]
pub struct Property {
	#[serde(rename = "type")]
	kind: PropertyType,
	#[serde(skip_serializing_if = "Option::is_none")]
	description: Option<&'static str>,
	#[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
	one_of: Option<Vec<&'static str>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	default: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	items: Option<Box<Property>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	properties: Option<BTreeMap<&'static str, Property>>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	required: Vec<&'static str>,
	#[serde(skip)]
	mandatory: bool,
	#[serde(skip)]
	sandboxed: Option<PathMode>,
}

impl Property {
	pub fn new(kind: PropertyType) -> Self {
		Self {
			kind,
			description: None,
			one_of: None,
			default: None,
			items: None,
			properties: (kind == PropertyType::Object).then(BTreeMap::new),
			required: Vec::new(),
			mandatory: false,
			sandboxed: None
		}
	}
	pub fn string(description: &'static str) -> Self {
		Self::new(PropertyType::String).describe(description)
	}
	/// A string resolved through the sandbox before the backend receives it.
	pub fn path(description: &'static str) -> Self {
		let mut prop = Self::string(description);
		prop.sandboxed = Some(PathMode::Resolved);
		prop
	}
	/// A path whose last component is not followed if it is a symlink.
	pub fn entry_path(description: &'static str) -> Self {
		let mut prop = Self::string(description);
		prop.sandboxed = Some(PathMode::Entry);
		prop
	}
	pub fn path_list(description: &'static str) -> Self {
		let mut item = Self::new(PropertyType::String);
		item.sandboxed = Some(PathMode::Resolved);
		Self::array(description, item)
	}
	pub fn string_list(description: &'static str) -> Self {
		Self::array(description, Self::new(PropertyType::String))
	}
	pub fn integer(description: &'static str) -> Self {
		Self::new(PropertyType::Integer).describe(description)
	}
	pub fn number(description: &'static str) -> Self {
		Self::new(PropertyType::Number).describe(description)
	}
	pub fn boolean(description: &'static str) -> Self {
		Self::new(PropertyType::Boolean).describe(description)
	}
	pub fn array(description: &'static str, items: Property) -> Self {
		let mut prop = Self::new(PropertyType::Array).describe(description);
		prop.items = Some(Box::new(items));
		prop
	}
	pub fn object() -> Self {
		Self::new(PropertyType::Object)
	}
	pub fn describe(mut self, description: &'static str) -> Self {
		self.description = Some(description);
		self
	}
	pub fn required(mut self) -> Self {
		self.mandatory = true;
		self
	}
	pub fn default_value(mut self, value: Value) -> Self {
		self.default = Some(value);
		self
	}
	pub fn one_of(mut self, values: &[&'static str]) -> Self {
		self.one_of = Some(values.to_vec());
		self
	}
	pub fn field(mut self, name: &'static str, prop: Property) -> Self {
		if prop.mandatory {
			self.required.push(name);
		}
		self.properties
			.get_or_insert_with(BTreeMap::new)
			.insert(name, prop);
		self
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
	pub name: &'static str,
	pub description: &'static str,
	pub input_schema: Property,
}

impl ToolDefinition {
	pub fn new(name: &'static str, description: &'static str) -> Self {
		Self {
			name,
			description,
			input_schema: Property::object()
		}
	}
	pub fn property(mut self, name: &'static str, prop: Property) -> Self {
		self.input_schema = self.input_schema.field(name, prop);
		self
	}
}

pub struct ToolRegistry {
	tools: Vec<ToolDefinition>,
	listing: Value,
}

impl ToolRegistry {
	pub fn new(tools: Vec<ToolDefinition>) -> Self {
		let listing = json!({ "tools": tools });
		Self {
			tools,
			listing
		}
	}
	/// The `tools/list` payload, built once at construction.
	pub fn listing(&self) -> &Value {
		&self.listing
	}
	pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
		self.tools
			.iter()
			.find(|tool| tool.name == name)
	}
	pub fn len(&self) -> usize {
		self.tools.len()
	}
	pub fn is_empty(&self) -> bool {
		self.tools.is_empty()
	}
	/// Validates `arguments` against the tool's schema, confines every path
	/// argument to the sandbox and decodes the result into the backend's call
	/// type. Nothing here touches a backend.
	pub fn prepare<C: DeserializeOwned>(&self, sandbox: &PathSandbox, name: &str, arguments: Option<&Value>) -> Result<C, ProtocolError> {
		let tool = self.get(name).ok_or_else(|| ProtocolError::unknown_tool(name))?;
		let arguments = match arguments {
			None | Some(Value::Null) => Value::Object(Map::new()),
			Some(value) => value.clone(),
		};
		if !arguments.is_object() {
			return Err(ProtocolError::invalid_params("arguments must be an object"));
		}
		let checked = check("", arguments, &tool.input_schema)?;
		let confined = confine(checked, &tool.input_schema, sandbox)?;
		serde_json::from_value(json!({
			"name": tool.name,
			"arguments": confined
		}))
			.map_err(|err| ProtocolError::invalid_params(format!("invalid arguments for {}: {}", name, err)))
	}
}

fn label(parent: &str, name: &str) -> String {
	if parent.is_empty() {
		name.to_string()
	}
	else {
		format!("{}.{}", parent, name)
	}
}

fn check(field: &str, value: Value, prop: &Property) -> Result<Value, ProtocolError> {
	let mistyped = |expected: &str| ProtocolError::invalid_params(format!("{} must be {}", field, expected));
	match prop.kind {
		PropertyType::String => {
			let text = value.as_str().ok_or_else(|| mistyped("a string"))?;
			if let Some(allowed) = &prop.one_of {
				if !allowed.contains(&text) {
					return Err(ProtocolError::invalid_params(format!(
						"{} must be one of: {}",
						field,
						allowed.join(", ")
					)));
				}
			}
			Ok(value)
		}
		PropertyType::Integer => {
			if value.is_i64() || value.is_u64() {
				Ok(value)
			}
			else {
				Err(mistyped("an integer"))
			}
		}
		PropertyType::Number => {
			if value.is_number() {
				Ok(value)
			}
			else {
				Err(mistyped("a number"))
			}
		}
		PropertyType::Boolean => {
			if value.is_boolean() {
				Ok(value)
			}
			else {
				Err(mistyped("a boolean"))
			}
		}
		PropertyType::Array => {
			let Value::Array(items) = value else {
				return Err(mistyped("an array"));
			};
			let Some(item_prop) = &prop.items else {
				return Ok(Value::Array(items));
			};
			items.into_iter()
				.enumerate()
				.map(|(index, item)| check(&format!("{}[{}]", field, index), item, item_prop))
				.collect::<Result<Vec<_>, _>>()
				.map(Value::Array)
		}
		PropertyType::Object => {
			let Value::Object(mut map) = value else {
				return Err(mistyped("an object"));
			};
			let Some(properties) = &prop.properties else {
				return Ok(Value::Object(map));
			};
			let mut out = Map::new();
			for (name, sub) in properties {
				let name_label = label(field, name);
				match map.remove(*name) {
					Some(Value::Null) | None => {
						if sub.mandatory {
							return Err(ProtocolError::invalid_params(format!("missing required argument: {}", name_label)));
						}
						if let Some(default) = &sub.default {
							out.insert(name.to_string(), default.clone());
						}
					}
					Some(found) => {
						out.insert(name.to_string(), check(&name_label, found, sub)?);
					}
				}
			}
			Ok(Value::Object(out))
		}
	}
}

fn confine(value: Value, prop: &Property, sandbox: &PathSandbox) -> Result<Value, ProtocolError> {
	match value {
		Value::String(text) if prop.sandboxed.is_some() => {
			let resolved = match prop.sandboxed {
				Some(PathMode::Entry) => sandbox.validate_entry(&text),
				_ => sandbox.validate(&text),
			}
				.map_err(|err| ProtocolError::access_denied(err.to_string()))?;
			Ok(Value::String(resolved.to_string_lossy().to_string()))
		}
		Value::Array(items) => match &prop.items {
			Some(item_prop) => items.into_iter()
				.map(|item| confine(item, item_prop, sandbox))
				.collect::<Result<Vec<_>, _>>()
				.map(Value::Array),
			None => Ok(Value::Array(items)),
		},
		Value::Object(map) => {
			let Some(properties) = &prop.properties else {
				return Ok(Value::Object(map));
			};
			let mut out = Map::new();
			for (name, item) in map {
				let confined = match properties.get(name.as_str()) {
					Some(sub) => confine(item, sub, sandbox)?,
					None => item,
				};
				out.insert(name, confined);
			}
			Ok(Value::Object(out))
		}
		other => Ok(other),
	}
}
