//! JSON <-> JavaScript value conversions
//!
//! | JSON    | JavaScript |
//! |---------|------------|
//! | null    | null       |
//! | boolean | Boolean    |
//! | number  | Number     |
//! | string  | String     |
//! | array   | Array      |
//! | object  | Object     |
//!
//! `undefined`, symbols and functions become JSON `null`; symbol keys are
//! skipped. Integral numbers within the safe integer range come back as JSON
//! integers.

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context,
};
use keel_common::{KeelError, Result};
use serde_json::Value as JsonValue;

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

pub fn json_to_js_value(json: JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .ok_or_else(|| KeelError::Structural("Number out of range".into())),
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.into_iter().enumerate() {
                let js_value = json_to_js_value(v, ctx)?;
                js_array.push(js_value, ctx).map_err(|e| {
                    KeelError::Internal(format!("Failed to push array element {}: {}", i, e))
                })?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let js_value = json_to_js_value(value, ctx)?;
                js_obj
                    .create_data_property_or_throw(js_string!(key.clone()), js_value, ctx)
                    .map_err(|e| {
                        KeelError::Internal(format!("Failed to set property '{}': {}", key, e))
                    })?;
            }
            Ok(js_obj.into())
        }
    }
}

pub fn js_value_to_json(value: JsValue, ctx: &mut Context) -> Result<JsonValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
            return Ok(JsonValue::from(n as i64));
        }
        // NaN and infinities have no JSON form
        return Ok(serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null));
    }

    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string_escaped()));
    }

    let Some(obj) = value.as_object() else {
        return Ok(JsonValue::Null);
    };

    if obj.is_callable() {
        return Ok(JsonValue::Null);
    }

    if obj.is_array() {
        let array = JsArray::from_object(obj.clone())
            .map_err(|e| KeelError::Internal(format!("Object is not a valid array: {}", e)))?;
        let length: usize = array
            .length(ctx)
            .map_err(|e| KeelError::Internal(format!("Failed to get array length: {}", e)))?
            .try_into()
            .map_err(|_| KeelError::Internal("Array length overflow".into()))?;

        let mut result = Vec::with_capacity(length);
        for i in 0..length {
            let elem = array.get(i, ctx).map_err(|e| {
                KeelError::Internal(format!("Failed to get array element {}: {}", i, e))
            })?;
            result.push(js_value_to_json(elem, ctx)?);
        }
        return Ok(JsonValue::Array(result));
    }

    let keys = obj
        .own_property_keys(ctx)
        .map_err(|e| KeelError::Internal(format!("Failed to get object keys: {}", e)))?;

    let mut result = serde_json::Map::new();
    for key in keys {
        let key_str = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let prop_value = obj.get(key.clone(), ctx).map_err(|e| {
            KeelError::Internal(format!("Failed to get property '{}': {}", key_str, e))
        })?;
        if prop_value.is_undefined() || prop_value.is_callable() {
            continue;
        }
        result.insert(key_str, js_value_to_json(prop_value, ctx)?);
    }

    Ok(JsonValue::Object(result))
}
