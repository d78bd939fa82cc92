// Inference from runtime values.
//
// Given an arbitrary value with no attached program, synthesize a type
// graph for it. Scalars become literals; containers union their
// widened element types; hosts carrying a program are reflected.
//
// Plain objects take an indirection: instead of inferring fields
// inline, a fresh program is emitted (typeof/widen/propertySignature
// per field) and handed to the interpreter. Field values may reference
// hosts whose reflection is deferred behind a placeholder; scheduling
// the field work as opcodes lets the normal patching machinery resolve
// those, where an inline walk would see stale placeholders.

use std::rc::Rc;

use regex::Regex;

use crate::host::HostObject;
use crate::ops::Op;
use crate::packed::{pack, thunk, PackedEntry, Unpacked};
use crate::types::{Builtin, ClassRef, Literal, TypeId, TypeKind};
use crate::vm::{Processor, Result};


// The runtime values reflection can encounter. Containers are
// immutable and shared; hosts are opaque handles.
#[derive(Clone, Debug)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    BigInt(i64),
    Str(Rc<String>),
    Regex(Rc<Regex>),
    Date(f64),
    List(Rc<Vec<Value>>),
    Set(Rc<Vec<Value>>),
    Map(Rc<Vec<(Value, Value)>>),
    Object(Rc<Vec<(String, Value)>>),
    Function(Rc<HostObject>),
    Class(Rc<HostObject>),
    Instance(Rc<HostObject>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::new(String::from(s)))
    }

    pub fn object(fields: &[(&str, Value)]) -> Value {
        Value::Object(Rc::new(
            fields
                .iter()
                .map(|(k, v)| (String::from(*k), v.clone()))
                .collect(),
        ))
    }
}

// JSON data infers directly; object keys arrive in the map's sorted
// order, which keeps inference deterministic.
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Str(Rc::new(s)),
            serde_json::Value::Array(items) => {
                Value::List(Rc::new(items.into_iter().map(Value::from).collect()))
            }
            serde_json::Value::Object(fields) => Value::Object(Rc::new(
                fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            )),
        }
    }
}


impl Processor {
    // Infer a type graph for a runtime value.
    pub fn type_infer(&mut self, value: &Value) -> Result<TypeId> {
        let id = self.infer_value(value)?;
        self.drain()?;
        Ok(id)
    }

    pub(crate) fn infer_value(&mut self, value: &Value) -> Result<TypeId> {
        let id = match value {
            Value::Undefined => self.types.alloc(TypeKind::Undefined),
            Value::Null => self.types.alloc(TypeKind::Null),
            Value::Bool(b) => self.types.alloc(TypeKind::Literal(Literal::Bool(*b))),
            Value::Num(n) => self.types.alloc(TypeKind::Literal(Literal::Num(*n))),
            Value::BigInt(n) => self.types.alloc(TypeKind::Literal(Literal::BigInt(*n))),
            Value::Str(s) => self.types.alloc(TypeKind::Literal(Literal::Str(s.clone()))),
            Value::Regex(r) => self.types.alloc(TypeKind::Literal(Literal::Regex(r.clone()))),
            Value::Date(_) => self.builtin_class(Builtin::Date, vec![]),
            Value::List(items) => {
                let elem = self.infer_container(items)?;
                let id = self.types.alloc(TypeKind::Array(elem));
                self.types.adopt(elem, id);
                id
            }
            Value::Set(items) => {
                let elem = self.infer_container(items)?;
                self.builtin_class(Builtin::Set, vec![elem])
            }
            Value::Map(pairs) => {
                let keys: Vec<Value> = pairs.iter().map(|(k, _)| k.clone()).collect();
                let values: Vec<Value> = pairs.iter().map(|(_, v)| v.clone()).collect();
                let key = self.infer_container(&keys)?;
                let value = self.infer_container(&values)?;
                self.builtin_class(Builtin::Map, vec![key, value])
            }
            Value::Function(host) => match host.program.clone() {
                Some(program) => self.enqueue_packed(&program, Some(host.clone()), vec![], true)?,
                None => {
                    let ret = self.types.alloc(TypeKind::Any);
                    let name = if host.name.is_empty() {
                        None
                    } else {
                        Some(host.name.clone())
                    };
                    let id = self.types.alloc(TypeKind::Function {
                        name,
                        parameters: Vec::new(),
                        ret,
                    });
                    self.types.adopt(ret, id);
                    id
                }
            },
            Value::Class(host) | Value::Instance(host) => match host.program.clone() {
                Some(program) => self.enqueue_packed(&program, Some(host.clone()), vec![], true)?,
                None => self.types.alloc(TypeKind::Class {
                    class_type: ClassRef::Host(host.clone()),
                    members: Vec::new(),
                    arguments: Vec::new(),
                    extends_arguments: Vec::new(),
                }),
            },
            Value::Object(entries) => self.infer_object(entries)?,
        };
        Ok(id)
    }

    // Union of the widened element types.
    fn infer_container(&mut self, items: &[Value]) -> Result<TypeId> {
        let mut members: Vec<TypeId> = Vec::new();
        for item in items {
            let inferred = self.infer_value(item)?;
            let widened = self.types.widen_literal(inferred);
            if !self.types.is_type_included(&members, widened) {
                members.push(widened);
            }
        }
        Ok(self.types.make_union(members))
    }

    // Emit and enqueue a program reflecting a plain object's fields.
    // Pool indices are single bytes, which bounds the field count an
    // emitted program can carry; values beyond that are not expected
    // from real objects.
    fn infer_object(&mut self, entries: &[(String, Value)]) -> Result<TypeId> {
        let mut ops: Vec<u8> = Vec::new();
        let mut stack: Vec<PackedEntry> = Vec::new();
        for (key, value) in entries {
            let value_slot = stack.len() as u8;
            stack.push(thunk(value.clone()));
            let name_slot = stack.len() as u8;
            stack.push(PackedEntry::str(key));
            ops.extend_from_slice(&[
                Op::Typeof as u8,
                value_slot,
                Op::Widen as u8,
                Op::PropertySignature as u8,
                name_slot,
            ]);
        }
        ops.push(Op::ObjectLiteral as u8);
        let packed = Rc::new(pack(&Unpacked { ops, stack }));
        self.enqueue_packed(&packed, None, vec![], false)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Types;

    fn kind_of(processor: &Processor, id: TypeId) -> &TypeKind {
        processor.types.kind(id)
    }

    fn member<'a>(types: &'a Types, obj: TypeId, name: &str) -> TypeId {
        types.get_member(obj, name).expect("member missing")
    }

    #[test]
    fn test_scalars() {
        let mut p = Processor::new();
        let id = p.type_infer(&Value::str("abc")).unwrap();
        match kind_of(&p, id) {
            TypeKind::Literal(Literal::Str(s)) => assert_eq!(s.as_str(), "abc"),
            other => panic!("unexpected {:?}", other)
        }

        let id = p.type_infer(&Value::Num(4.0)).unwrap();
        assert!(matches!(kind_of(&p, id), TypeKind::Literal(Literal::Num(_))));

        let id = p.type_infer(&Value::Bool(true)).unwrap();
        assert!(matches!(kind_of(&p, id), TypeKind::Literal(Literal::Bool(true))));

        let id = p.type_infer(&Value::Null).unwrap();
        assert!(matches!(kind_of(&p, id), TypeKind::Null));

        let id = p.type_infer(&Value::Undefined).unwrap();
        assert!(matches!(kind_of(&p, id), TypeKind::Undefined));
    }

    #[test]
    fn test_regex_is_literal() {
        let mut p = Processor::new();
        let re = Rc::new(Regex::new("a+").unwrap());
        let id = p.type_infer(&Value::Regex(re)).unwrap();
        match kind_of(&p, id) {
            TypeKind::Literal(Literal::Regex(r)) => assert_eq!(r.as_str(), "a+"),
            other => panic!("unexpected {:?}", other)
        }
    }

    #[test]
    fn test_list_unions_widened_elements() {
        let mut p = Processor::new();
        let value = Value::List(Rc::new(vec![
            Value::Num(1.0),
            Value::Num(2.0),
            Value::str("x"),
        ]));
        let id = p.type_infer(&value).unwrap();
        match kind_of(&p, id) {
            TypeKind::Array(elem) => match kind_of(&p, *elem) {
                TypeKind::Union(members) => {
                    assert_eq!(members.len(), 2);
                    assert!(matches!(kind_of(&p, members[0]), TypeKind::Number(None)));
                    assert!(matches!(kind_of(&p, members[1]), TypeKind::String));
                }
                other => panic!("expected union element, got {:?}", other)
            },
            other => panic!("expected array, got {:?}", other)
        }
    }

    #[test]
    fn test_empty_list() {
        let mut p = Processor::new();
        let id = p.type_infer(&Value::List(Rc::new(vec![]))).unwrap();
        match kind_of(&p, id) {
            TypeKind::Array(elem) => assert!(p.types.is_never(*elem)),
            other => panic!("expected array, got {:?}", other)
        }
    }

    #[test]
    fn test_set_map_date() {
        let mut p = Processor::new();
        let id = p.type_infer(&Value::Set(Rc::new(vec![Value::Num(1.0)]))).unwrap();
        match kind_of(&p, id) {
            TypeKind::Class { class_type: ClassRef::Builtin(Builtin::Set), .. } => {
                let args = &p.types.get(id).type_arguments;
                assert_eq!(args.len(), 1);
                assert!(matches!(kind_of(&p, args[0]), TypeKind::Number(None)));
            }
            other => panic!("unexpected {:?}", other)
        }

        let pairs = vec![(Value::str("k"), Value::Num(1.0))];
        let id = p.type_infer(&Value::Map(Rc::new(pairs))).unwrap();
        match kind_of(&p, id) {
            TypeKind::Class { class_type: ClassRef::Builtin(Builtin::Map), .. } => {
                let args = &p.types.get(id).type_arguments;
                assert_eq!(args.len(), 2);
                assert!(matches!(kind_of(&p, args[0]), TypeKind::String));
                assert!(matches!(kind_of(&p, args[1]), TypeKind::Number(None)));
            }
            other => panic!("unexpected {:?}", other)
        }

        let id = p.type_infer(&Value::Date(0.0)).unwrap();
        assert!(matches!(
            kind_of(&p, id),
            TypeKind::Class { class_type: ClassRef::Builtin(Builtin::Date), .. }
        ));
    }

    #[test]
    fn test_function_without_program() {
        let mut p = Processor::new();
        let host = HostObject::bare("greet");
        let id = p.type_infer(&Value::Function(host)).unwrap();
        match kind_of(&p, id) {
            TypeKind::Function { name, parameters, ret } => {
                assert_eq!(name.as_deref(), Some("greet"));
                assert!(parameters.is_empty());
                assert!(matches!(kind_of(&p, *ret), TypeKind::Any));
            }
            other => panic!("unexpected {:?}", other)
        }
    }

    #[test]
    fn test_plain_object() {
        let mut p = Processor::new();
        let value = Value::object(&[("x", Value::Num(1.0)), ("y", Value::str("s"))]);
        let id = p.type_infer(&value).unwrap();

        assert!(matches!(kind_of(&p, id), TypeKind::ObjectLiteral(_)));
        let x = member(&p.types, id, "x");
        assert!(matches!(
            kind_of(&p, p.types.member_type(x).unwrap()),
            TypeKind::Number(None)
        ));
        let y = member(&p.types, id, "y");
        assert!(matches!(
            kind_of(&p, p.types.member_type(y).unwrap()),
            TypeKind::String
        ));
    }

    #[test]
    fn test_nested_object() {
        let mut p = Processor::new();
        let inner = Value::object(&[("deep", Value::Bool(true))]);
        let value = Value::object(&[("inner", inner)]);
        let id = p.type_infer(&value).unwrap();

        let inner_member = member(&p.types, id, "inner");
        let inner_ty = p.types.member_type(inner_member).unwrap();
        assert!(matches!(kind_of(&p, inner_ty), TypeKind::ObjectLiteral(_)));
        let deep = member(&p.types, inner_ty, "deep");
        assert!(matches!(
            kind_of(&p, p.types.member_type(deep).unwrap()),
            TypeKind::Boolean
        ));
    }

    #[test]
    fn test_from_json() {
        let mut p = Processor::new();
        let json: serde_json::Value =
            serde_json::from_str("{\"n\": 3, \"s\": \"hi\", \"list\": [1, 2]}").unwrap();
        let id = p.type_infer(&Value::from(json)).unwrap();

        let n = member(&p.types, id, "n");
        assert!(matches!(
            kind_of(&p, p.types.member_type(n).unwrap()),
            TypeKind::Number(None)
        ));
        let list = member(&p.types, id, "list");
        let list_ty = p.types.member_type(list).unwrap();
        assert!(matches!(kind_of(&p, list_ty), TypeKind::Array(_)));
    }
}
