//! The serialize/deserialize fallback used when structural sharing is
//! unsafe (the value aliases itself) or unsupported (objects without
//! snapshot conversion).
//!
//! The wire form is JSON. Containers referenced through more than one path
//! are tagged `"$id"` at their first occurrence and written as
//! `{"$ref": id}` afterwards, so cyclic and DAG-shaped values deserialize
//! to structurally-equivalent graphs. Vector-shaped arrays are plain JSON
//! lists; keyed arrays are `{"$k": [[key, value], ...]}`; objects are
//! `{"$o": class, "$f": [[name, value], ...]}`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{json, Map, Number, Value as Json};
use thiserror::Error;

use crate::value::{Array, ArrayKey, Object, Value};

#[derive(Debug, Error)]
pub enum CodecError {
  #[error("malformed serialized value: {0}")]
  Json(#[from] serde_json::Error),
  #[error("unresolved back-reference ${0}")]
  DanglingRef(u64),
  #[error("unsupported wire form: {0}")]
  Malformed(&'static str),
}

/// Serializes a local value to its blob form. Handles aliased and cyclic
/// graphs; fails only on non-finite doubles, which have no JSON encoding.
pub fn serialize(v: &Value) -> Result<Arc<str>, CodecError> {
  let mut seen = HashSet::new();
  let mut shared = HashSet::new();
  collect_shared(v, &mut seen, &mut shared);
  let mut enc = Encoder { shared, ids: HashMap::new(), next_id: 0 };
  let wire = enc.encode(v)?;
  Ok(Arc::from(serde_json::to_string(&wire)?.as_str()))
}

/// Deserializes a blob back into an independent local value.
pub fn deserialize(blob: &str) -> Result<Value, CodecError> {
  let wire: Json = serde_json::from_str(blob)?;
  let mut ids = HashMap::new();
  decode(&wire, &mut ids)
}

/// Deserializes and re-serializes a blob. Used when a caller hands in an
/// already-serialized value during priming, to normalize it to this codec's
/// wire form before it is stored.
pub fn reserialize(blob: &str) -> Result<Arc<str>, CodecError> {
  serialize(&deserialize(blob)?)
}

// Marks every container cell reachable through more than one path.
fn collect_shared(v: &Value, seen: &mut HashSet<usize>, shared: &mut HashSet<usize>) {
  match v {
    Value::Array(a) => {
      let ptr = Rc::as_ptr(a) as usize;
      if !seen.insert(ptr) {
        shared.insert(ptr);
        return;
      }
      for (_, child) in a.borrow().entries() {
        collect_shared(child, seen, shared);
      }
    }
    Value::Object(o) => {
      let ptr = Rc::as_ptr(o) as usize;
      if !seen.insert(ptr) {
        shared.insert(ptr);
        return;
      }
      for (_, child) in o.borrow().fields() {
        collect_shared(child, seen, shared);
      }
    }
    _ => {}
  }
}

struct Encoder {
  shared: HashSet<usize>,
  ids: HashMap<usize, u64>,
  next_id: u64,
}

impl Encoder {
  fn encode(&mut self, v: &Value) -> Result<Json, CodecError> {
    match v {
      Value::Null => Ok(Json::Null),
      Value::Bool(b) => Ok(json!(b)),
      Value::Int(i) => Ok(json!(i)),
      Value::Double(d) => Number::from_f64(*d)
        .map(Json::Number)
        .ok_or(CodecError::Malformed("non-finite double")),
      Value::StaticStr(s) => Ok(json!(s)),
      Value::Str(s) => Ok(json!(&**s)),
      Value::Array(a) => {
        let ptr = Rc::as_ptr(a) as usize;
        if let Some(id) = self.ids.get(&ptr) {
          return Ok(json!({ "$ref": id }));
        }
        let id = self.shared.contains(&ptr).then(|| self.assign(ptr));
        let arr = a.borrow();
        if arr.is_vector_shape() {
          let mut items = Vec::with_capacity(arr.len());
          for (_, child) in arr.entries() {
            items.push(self.encode(child)?);
          }
          match id {
            None => Ok(Json::Array(items)),
            Some(id) => Ok(json!({ "$id": id, "$v": items })),
          }
        } else {
          let mut pairs = Vec::with_capacity(arr.len());
          for (key, child) in arr.entries() {
            let k = match key {
              ArrayKey::Int(i) => json!(i),
              ArrayKey::Str(s) => json!(&**s),
            };
            pairs.push(Json::Array(vec![k, self.encode(child)?]));
          }
          let mut map = Map::new();
          if let Some(id) = id {
            map.insert("$id".into(), json!(id));
          }
          map.insert("$k".into(), Json::Array(pairs));
          Ok(Json::Object(map))
        }
      }
      Value::Object(o) => {
        let ptr = Rc::as_ptr(o) as usize;
        if let Some(id) = self.ids.get(&ptr) {
          return Ok(json!({ "$ref": id }));
        }
        let id = self.shared.contains(&ptr).then(|| self.assign(ptr));
        let obj = o.borrow();
        let mut fields = Vec::with_capacity(obj.len());
        for (name, child) in obj.fields() {
          fields.push(Json::Array(vec![json!(&**name), self.encode(child)?]));
        }
        let mut map = Map::new();
        if let Some(id) = id {
          map.insert("$id".into(), json!(id));
        }
        map.insert("$o".into(), json!(&**obj.class()));
        map.insert("$f".into(), Json::Array(fields));
        Ok(Json::Object(map))
      }
    }
  }

  fn assign(&mut self, ptr: usize) -> u64 {
    let id = self.next_id;
    self.next_id += 1;
    self.ids.insert(ptr, id);
    id
  }
}

fn decode(wire: &Json, ids: &mut HashMap<u64, Value>) -> Result<Value, CodecError> {
  match wire {
    Json::Null => Ok(Value::Null),
    Json::Bool(b) => Ok(Value::Bool(*b)),
    Json::Number(n) => {
      if let Some(i) = n.as_i64() {
        Ok(Value::Int(i))
      } else {
        n.as_f64().map(Value::Double).ok_or(CodecError::Malformed("unrepresentable number"))
      }
    }
    Json::String(s) => Ok(Value::str(s)),
    Json::Array(items) => {
      let cell = Rc::new(RefCell::new(Array::new()));
      for item in items {
        let child = decode(item, ids)?;
        cell.borrow_mut().push(child);
      }
      Ok(Value::Array(cell))
    }
    Json::Object(map) => {
      if let Some(id) = map.get("$ref") {
        let id = id.as_u64().ok_or(CodecError::Malformed("non-integer $ref"))?;
        return ids.get(&id).cloned().ok_or(CodecError::DanglingRef(id));
      }
      let id = match map.get("$id") {
        Some(id) => Some(id.as_u64().ok_or(CodecError::Malformed("non-integer $id"))?),
        None => None,
      };
      if let Some(class) = map.get("$o") {
        let class = class.as_str().ok_or(CodecError::Malformed("non-string class"))?;
        let cell = Rc::new(RefCell::new(Object::new(class)));
        // Register before decoding fields so self-references resolve.
        if let Some(id) = id {
          ids.insert(id, Value::Object(cell.clone()));
        }
        let fields = map
          .get("$f")
          .and_then(Json::as_array)
          .ok_or(CodecError::Malformed("object without field list"))?;
        for pair in fields {
          let (name, child) = field_pair(pair)?;
          let child = decode(child, ids)?;
          cell.borrow_mut().set(name, child);
        }
        return Ok(Value::Object(cell));
      }
      let cell = Rc::new(RefCell::new(Array::new()));
      if let Some(id) = id {
        ids.insert(id, Value::Array(cell.clone()));
      }
      if let Some(items) = map.get("$v").and_then(Json::as_array) {
        for item in items {
          let child = decode(item, ids)?;
          cell.borrow_mut().push(child);
        }
        return Ok(Value::Array(cell));
      }
      let pairs = map
        .get("$k")
        .and_then(Json::as_array)
        .ok_or(CodecError::Malformed("unrecognized wire object"))?;
      for pair in pairs {
        let (key, child) = key_pair(pair)?;
        let child = decode(child, ids)?;
        cell.borrow_mut().insert(key, child);
      }
      Ok(Value::Array(cell))
    }
  }
}

fn field_pair(pair: &Json) -> Result<(&str, &Json), CodecError> {
  let pair = pair.as_array().filter(|p| p.len() == 2).ok_or(CodecError::Malformed("bad field pair"))?;
  let name = pair[0].as_str().ok_or(CodecError::Malformed("non-string field name"))?;
  Ok((name, &pair[1]))
}

fn key_pair(pair: &Json) -> Result<(ArrayKey, &Json), CodecError> {
  let pair = pair.as_array().filter(|p| p.len() == 2).ok_or(CodecError::Malformed("bad entry pair"))?;
  let key = match &pair[0] {
    Json::Number(n) => {
      ArrayKey::Int(n.as_i64().ok_or(CodecError::Malformed("non-integer array key"))?)
    }
    Json::String(s) => ArrayKey::Str(Arc::from(s.as_str())),
    _ => return Err(CodecError::Malformed("illegal array key type")),
  };
  Ok((key, &pair[1]))
}
