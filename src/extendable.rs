// Structural assignability.
//
// `is_extendable(left, right)` answers `left extends right` the way the
// conditional-type opcode needs it: structurally, with `infer` nodes on
// the right side capturing whatever they line up against on the left.
// Captures are collected into an out-parameter rather than written
// anywhere; the interpreter owns the variable slots and applies them.
//
// The check is coinductive: a (left, right) pair under comparison is
// assumed assignable while its components are compared, which is what
// lets self-referential graphs terminate.

use std::collections::HashSet;

use regex::Regex;

use crate::types::{Literal, TypeId, TypeKind, Types};


// What an `infer` slot caught. A trailing `...infer` in a tuple
// pattern catches the whole remainder, which only the caller can
// materialize as a node.
#[derive(Clone, Debug)]
pub enum Captured {
    Type(TypeId),
    Tuple(Vec<TypeId>),
}

pub type InferAssignments = Vec<(u8, u16, Captured)>;


pub fn is_extendable(types: &Types, left: TypeId, right: TypeId) -> bool {
    let mut inferred = InferAssignments::new();
    extends_with_inference(types, left, right, &mut inferred)
}

pub fn extends_with_inference(
    types: &Types,
    left: TypeId,
    right: TypeId,
    inferred: &mut InferAssignments
) -> bool {
    let mut seen = HashSet::new();
    check(types, left, right, inferred, &mut seen)
}


type Seen = HashSet<(u32, u32)>;

fn check(
    types: &Types,
    left: TypeId,
    right: TypeId,
    inferred: &mut InferAssignments,
    seen: &mut Seen
) -> bool {
    if left == right {
        return true;
    }
    if !seen.insert((left.0, right.0)) {
        return true;
    }
    use TypeKind as K;

    // Inference wildcards accept anything and remember what they saw.
    if let K::Infer { frame_offset, index } = types.kind(right) {
        inferred.push((*frame_offset, *index, Captured::Type(left)));
        return true;
    }

    match (types.kind(left), types.kind(right)) {
        (_, K::Any) | (_, K::Unknown) => true,
        (K::Any, _) => true,
        (K::Never, _) => true,
        (_, K::Never) => false,

        // Unions: every left member must fit; any right member may
        // receive.
        (K::Union(members), _) => {
            members.iter().all(|&m| check(types, m, right, inferred, seen))
        }
        (_, K::Union(members)) => {
            members.iter().any(|&m| check(types, left, m, inferred, seen))
        }
        (_, K::Intersection(members)) => {
            members.iter().all(|&m| check(types, left, m, inferred, seen))
        }
        (K::Intersection(members), _) => {
            members.iter().any(|&m| check(types, m, right, inferred, seen))
        }

        (K::Literal(a), K::Literal(b)) => a == b,
        (K::Literal(Literal::Str(_)), K::String) => true,
        (K::Literal(Literal::Num(_)), K::Number(_)) => true,
        (K::Literal(Literal::Bool(_)), K::Boolean) => true,
        (K::Literal(Literal::BigInt(_)), K::BigInt) => true,
        (K::Literal(Literal::Regex(_)), K::Regexp) => true,

        (K::String, K::String)
        | (K::Boolean, K::Boolean)
        | (K::BigInt, K::BigInt)
        | (K::Symbol, K::Symbol)
        | (K::Null, K::Null)
        | (K::Undefined, K::Undefined)
        | (K::Void, K::Void)
        | (K::Regexp, K::Regexp) => true,
        (K::Undefined, K::Void) => true,
        (K::Number(_), K::Number(None)) => true,
        (K::Number(a), K::Number(b)) => a == b,

        (K::Literal(Literal::Str(text)), K::TemplateLiteral(parts)) => {
            match template_pattern(types, parts) {
                Some(pattern) => match Regex::new(&pattern) {
                    Ok(re) => re.is_match(text),
                    Err(_) => false
                },
                None => false
            }
        }
        (K::String, K::TemplateLiteral(parts)) => {
            parts.iter().all(|&p| matches!(types.kind(p), K::String))
        }
        (K::TemplateLiteral(a), K::TemplateLiteral(b)) => {
            a.len() == b.len()
                && a.iter().zip(b.iter()).all(|(&x, &y)| check(types, x, y, inferred, seen))
        }
        (K::TemplateLiteral(_), K::String) => true,

        (K::Array(a), K::Array(b)) => check(types, *a, *b, inferred, seen),
        (K::Tuple(members), K::Array(elem)) => {
            let elem = *elem;
            members.iter().all(|&m| {
                let ty = tuple_member_type(types, m);
                match types.kind(ty) {
                    K::Rest(inner) => check(types, *inner, elem, inferred, seen),
                    _ => check(types, ty, elem, inferred, seen)
                }
            })
        }
        (K::Tuple(a), K::Tuple(b)) => tuple_extends(types, a, b, inferred, seen),

        // Anything non-primitive fits the `object` catch-all.
        (K::ObjectLiteral(_), K::Object)
        | (K::Class { .. }, K::Object)
        | (K::Array(_), K::Object)
        | (K::Tuple(_), K::Object)
        | (K::Function { .. }, K::Object) => true,

        (
            K::Class { class_type: a, .. },
            K::Class { class_type: b, .. },
        ) if a.same_host(b) => true,
        (K::ObjectLiteral(_), K::ObjectLiteral(_))
        | (K::ObjectLiteral(_), K::Class { .. })
        | (K::Class { .. }, K::ObjectLiteral(_))
        | (K::Class { .. }, K::Class { .. }) => {
            object_extends(types, left, right, inferred, seen)
        }

        (
            K::Function { parameters: lp, ret: lr, .. },
            K::Function { parameters: rp, ret: rr, .. },
        )
        | (
            K::Method { parameters: lp, ret: lr, .. },
            K::MethodSignature { parameters: rp, ret: rr, .. },
        )
        | (
            K::MethodSignature { parameters: lp, ret: lr, .. },
            K::Method { parameters: rp, ret: rr, .. },
        )
        | (
            K::Method { parameters: lp, ret: lr, .. },
            K::Method { parameters: rp, ret: rr, .. },
        )
        | (
            K::MethodSignature { parameters: lp, ret: lr, .. },
            K::MethodSignature { parameters: rp, ret: rr, .. },
        )
        | (
            K::Function { parameters: lp, ret: lr, .. },
            K::MethodSignature { parameters: rp, ret: rr, .. },
        ) => signature_extends(types, lp, *lr, rp, *rr, inferred, seen),

        (K::Promise(a), K::Promise(b)) => check(types, *a, *b, inferred, seen),

        (K::Enum { .. }, K::Enum { .. }) => types.structural_eq(left, right),
        (
            K::TypeParameter { name: a },
            K::TypeParameter { name: b },
        ) => a == b,

        (_, _) => false
    }
}

fn signature_extends(
    types: &Types,
    left_params: &[TypeId],
    left_ret: TypeId,
    right_params: &[TypeId],
    right_ret: TypeId,
    inferred: &mut InferAssignments,
    seen: &mut Seen
) -> bool {
    let pairs = left_params.len().min(right_params.len());
    for i in 0..pairs {
        let l = param_type(types, left_params[i]);
        let r = param_type(types, right_params[i]);
        if !check(types, l, r, inferred, seen) {
            return false;
        }
    }
    check(types, left_ret, right_ret, inferred, seen)
}

fn param_type(types: &Types, id: TypeId) -> TypeId {
    types.member_type(id).unwrap_or(id)
}

fn tuple_member_type(types: &Types, id: TypeId) -> TypeId {
    match types.kind(id) {
        TypeKind::TupleMember { ty, .. } => *ty,
        _ => id
    }
}

fn tuple_member_optional(types: &Types, id: TypeId) -> bool {
    match types.kind(id) {
        TypeKind::TupleMember { optional, .. } => *optional,
        _ => false
    }
}

fn tuple_extends(
    types: &Types,
    left: &[TypeId],
    right: &[TypeId],
    inferred: &mut InferAssignments,
    seen: &mut Seen
) -> bool {
    let mut li = 0;
    for (ri, &rm) in right.iter().enumerate() {
        let rty = tuple_member_type(types, rm);
        if let TypeKind::Rest(inner) = types.kind(rty) {
            let inner = *inner;
            // A rest pattern consumes the remainder; it only makes
            // sense in trailing position.
            if ri + 1 != right.len() {
                return false;
            }
            if let TypeKind::Infer { frame_offset, index } = types.kind(inner) {
                inferred.push((*frame_offset, *index, Captured::Tuple(left[li..].to_vec())));
                return true;
            }
            return left[li..].iter().all(|&lm| {
                let lty = tuple_member_type(types, lm);
                check(types, lty, inner, inferred, seen)
            });
        }
        if li >= left.len() {
            if tuple_member_optional(types, rm) {
                continue;
            }
            return false;
        }
        let lty = tuple_member_type(types, left[li]);
        if !check(types, lty, rty, inferred, seen) {
            return false;
        }
        li += 1;
    }
    li == left.len()
}

fn object_extends(
    types: &Types,
    left: TypeId,
    right: TypeId,
    inferred: &mut InferAssignments,
    seen: &mut Seen
) -> bool {
    for &rm in types.members_of(right) {
        if let TypeKind::IndexSignature { ty, .. } = types.kind(rm) {
            let rty = *ty;
            for &lm in types.members_of(left) {
                if let Some(lty) = types.member_type(lm) {
                    if !check(types, lty, rty, inferred, seen) {
                        return false;
                    }
                }
            }
            continue;
        }
        let name = match types.member_name(rm) {
            Some(n) => n,
            None => continue
        };
        match types.get_member(left, name) {
            None => {
                if !types.member_optional(rm) {
                    return false;
                }
            }
            Some(lm) => {
                let l = member_facing_type(types, lm);
                let r = member_facing_type(types, rm);
                if !check(types, l, r, inferred, seen) {
                    return false;
                }
            }
        }
    }
    true
}

// The type a member presents to assignability: its value type, or the
// member node itself for callables (the signature arms of `check`
// handle those).
fn member_facing_type(types: &Types, id: TypeId) -> TypeId {
    types.member_type(id).unwrap_or(id)
}


// Compile template-literal parts into an anchored pattern. Returns
// None when a part has no textual shape.
fn template_pattern(types: &Types, parts: &[TypeId]) -> Option<String> {
    let mut pattern = String::from("^");
    for &part in parts {
        match types.kind(part) {
            TypeKind::Literal(l) => pattern.push_str(&regex::escape(&l.to_text())),
            TypeKind::String | TypeKind::Any | TypeKind::Unknown => pattern.push_str(".*"),
            TypeKind::Number(_) => pattern.push_str(r"[-+]?\d+(\.\d+)?"),
            TypeKind::BigInt => pattern.push_str(r"[-+]?\d+"),
            TypeKind::Boolean => pattern.push_str("(true|false)"),
            _ => return None
        }
    }
    pattern.push('$');
    Some(pattern)
}


// The indexed-access operator `T[K]`.
//
// Returns the raw member type; the interpreter copies it and stamps
// the access origin before pushing.
pub fn index_access(types: &mut Types, container: TypeId, index: TypeId) -> TypeId {
    if let TypeKind::Union(keys) = types.kind(index) {
        let keys = keys.clone();
        let results: Vec<TypeId> = keys
            .iter()
            .map(|&k| index_access(types, container, k))
            .collect();
        return types.make_union(results);
    }

    match types.kind(container).clone() {
        TypeKind::Any => types.alloc(TypeKind::Any),
        TypeKind::ObjectLiteral(_) | TypeKind::Class { .. } => {
            object_index_access(types, container, index)
        }
        TypeKind::Tuple(members) => match types.kind(index).clone() {
            TypeKind::Literal(Literal::Num(n)) => {
                let i = n as usize;
                if n >= 0.0 && i < members.len() {
                    tuple_member_type(types, members[i])
                } else {
                    types.alloc(TypeKind::Never)
                }
            }
            TypeKind::Number(_) => {
                let element_types: Vec<TypeId> = members
                    .iter()
                    .map(|&m| tuple_member_type(types, m))
                    .collect();
                types.make_union(element_types)
            }
            _ => types.alloc(TypeKind::Never)
        },
        TypeKind::Array(elem) => match types.kind(index) {
            TypeKind::Literal(Literal::Num(_)) | TypeKind::Number(_) => elem,
            _ => types.alloc(TypeKind::Never)
        },
        _ => types.alloc(TypeKind::Never)
    }
}

fn object_index_access(types: &mut Types, container: TypeId, index: TypeId) -> TypeId {
    if let TypeKind::Literal(Literal::Str(name)) = types.kind(index) {
        let name = name.to_string();
        if let Some(member) = types.get_member(container, &name) {
            return member_result(types, member);
        }
    }
    // No named member: fall through to index signatures.
    let wants_string = matches!(
        types.kind(index),
        TypeKind::String | TypeKind::Literal(Literal::Str(_))
    );
    let wants_number = matches!(
        types.kind(index),
        TypeKind::Number(_) | TypeKind::Literal(Literal::Num(_))
    );
    for &m in &types.members_of(container).to_vec() {
        if let TypeKind::IndexSignature { index: sig_index, ty } = types.kind(m) {
            let matched = match types.kind(*sig_index) {
                TypeKind::String => wants_string,
                TypeKind::Number(_) => wants_number,
                _ => false
            };
            if matched {
                return *ty;
            }
        }
    }
    types.alloc(TypeKind::Never)
}

fn member_result(types: &mut Types, member: TypeId) -> TypeId {
    match types.kind(member).clone() {
        TypeKind::Property { ty, optional, .. }
        | TypeKind::PropertySignature { ty, optional, .. } => {
            if optional {
                let undef = types.alloc(TypeKind::Undefined);
                types.make_union(vec![ty, undef])
            } else {
                ty
            }
        }
        TypeKind::Method { name, parameters, ret, .. } => {
            types.alloc(TypeKind::Function { name: Some(name), parameters, ret })
        }
        TypeKind::MethodSignature { name, parameters, ret, .. } => {
            types.alloc(TypeKind::Function { name: Some(name), parameters, ret })
        }
        _ => types.alloc(TypeKind::Never)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn lit_str(types: &mut Types, s: &str) -> TypeId {
        types.alloc(TypeKind::Literal(Literal::Str(Rc::new(String::from(s)))))
    }

    fn lit_num(types: &mut Types, n: f64) -> TypeId {
        types.alloc(TypeKind::Literal(Literal::Num(n)))
    }

    fn prop_sig(types: &mut Types, name: &str, ty: TypeId, optional: bool) -> TypeId {
        types.alloc(TypeKind::PropertySignature {
            name: String::from(name),
            ty,
            optional,
            readonly: false,
            default: None,
            description: None,
        })
    }

    #[test]
    fn test_primitives_and_literals() {
        let mut t = Types::new();
        let s = t.alloc(TypeKind::String);
        let n = t.alloc(TypeKind::Number(None));
        let abc = lit_str(&mut t, "abc");
        let one = lit_num(&mut t, 1.0);
        let any = t.alloc(TypeKind::Any);
        let never = t.alloc(TypeKind::Never);

        assert!(is_extendable(&t, abc, s));
        assert!(is_extendable(&t, one, n));
        assert!(!is_extendable(&t, s, abc));
        assert!(!is_extendable(&t, abc, n));
        assert!(is_extendable(&t, s, any));
        assert!(is_extendable(&t, any, s));
        assert!(is_extendable(&t, never, s));
        assert!(!is_extendable(&t, s, never));
    }

    #[test]
    fn test_unions() {
        let mut t = Types::new();
        let s = t.alloc(TypeKind::String);
        let n = t.alloc(TypeKind::Number(None));
        let null = t.alloc(TypeKind::Null);
        let sn = t.alloc(TypeKind::Union(vec![s, n]));
        let s_or_null = t.alloc(TypeKind::Union(vec![s, null]));

        assert!(is_extendable(&t, s, sn));
        assert!(is_extendable(&t, sn, sn));
        assert!(!is_extendable(&t, s_or_null, sn));
        assert!(!is_extendable(&t, null, sn));
    }

    #[test]
    fn test_objects() {
        let mut t = Types::new();
        let s = t.alloc(TypeKind::String);
        let n = t.alloc(TypeKind::Number(None));
        let a = prop_sig(&mut t, "a", n, false);
        let b = prop_sig(&mut t, "b", s, false);
        let wide = t.alloc(TypeKind::ObjectLiteral(vec![a, b]));
        let a2 = prop_sig(&mut t, "a", n, false);
        let narrow = t.alloc(TypeKind::ObjectLiteral(vec![a2]));

        // Extra members are fine; missing required members are not.
        assert!(is_extendable(&t, wide, narrow));
        assert!(!is_extendable(&t, narrow, wide));

        let b_opt = prop_sig(&mut t, "b", s, true);
        let lenient = t.alloc(TypeKind::ObjectLiteral(vec![a2, b_opt]));
        assert!(is_extendable(&t, narrow, lenient));
    }

    #[test]
    fn test_tuples_and_arrays() {
        let mut t = Types::new();
        let s = t.alloc(TypeKind::String);
        let n = t.alloc(TypeKind::Number(None));
        let arr_n = t.alloc(TypeKind::Array(n));
        let one = lit_num(&mut t, 1.0);
        let two = lit_num(&mut t, 2.0);
        let m1 = t.alloc(TypeKind::TupleMember { ty: one, name: None, optional: false });
        let m2 = t.alloc(TypeKind::TupleMember { ty: two, name: None, optional: false });
        let pair = t.alloc(TypeKind::Tuple(vec![m1, m2]));

        assert!(is_extendable(&t, pair, arr_n));
        let arr_s = t.alloc(TypeKind::Array(s));
        assert!(!is_extendable(&t, pair, arr_s));

        let mn1 = t.alloc(TypeKind::TupleMember { ty: n, name: None, optional: false });
        let mn2 = t.alloc(TypeKind::TupleMember { ty: n, name: None, optional: false });
        let pair_n = t.alloc(TypeKind::Tuple(vec![mn1, mn2]));
        assert!(is_extendable(&t, pair, pair_n));
        assert!(!is_extendable(&t, pair_n, pair));
    }

    #[test]
    fn test_infer_capture() {
        let mut t = Types::new();
        let s = t.alloc(TypeKind::String);
        let inf = t.alloc(TypeKind::Infer { frame_offset: 0, index: 1 });

        let mut captured = InferAssignments::new();
        assert!(extends_with_inference(&t, s, inf, &mut captured));
        assert_eq!(captured.len(), 1);
        let (offset, index, value) = &captured[0];
        assert_eq!((*offset, *index), (0, 1));
        match value {
            Captured::Type(id) => assert_eq!(*id, s),
            other => panic!("expected single capture, got {:?}", other)
        }
    }

    #[test]
    fn test_rest_infer_captures_tail() {
        let mut t = Types::new();
        let one = lit_num(&mut t, 1.0);
        let two = lit_num(&mut t, 2.0);
        let three = lit_num(&mut t, 3.0);
        let members: Vec<TypeId> = [one, two, three]
            .iter()
            .map(|&ty| t.alloc(TypeKind::TupleMember { ty, name: None, optional: false }))
            .collect();
        let tuple = t.alloc(TypeKind::Tuple(members.clone()));

        // [infer H, ...infer T]
        let head = t.alloc(TypeKind::Infer { frame_offset: 0, index: 0 });
        let hm = t.alloc(TypeKind::TupleMember { ty: head, name: None, optional: false });
        let tail = t.alloc(TypeKind::Infer { frame_offset: 0, index: 1 });
        let rest = t.alloc(TypeKind::Rest(tail));
        let tm = t.alloc(TypeKind::TupleMember { ty: rest, name: None, optional: false });
        let pattern = t.alloc(TypeKind::Tuple(vec![hm, tm]));

        let mut captured = InferAssignments::new();
        assert!(extends_with_inference(&t, tuple, pattern, &mut captured));
        assert_eq!(captured.len(), 2);
        match &captured[0].2 {
            Captured::Type(id) => assert_eq!(*id, members[0]),
            other => panic!("unexpected head capture {:?}", other)
        }
        match &captured[1].2 {
            Captured::Tuple(rest) => assert_eq!(rest, &members[1..].to_vec()),
            other => panic!("unexpected tail capture {:?}", other)
        }
    }

    #[test]
    fn test_template_literal_matching() {
        let mut t = Types::new();
        let prefix = lit_str(&mut t, "id-");
        let s = t.alloc(TypeKind::String);
        let template = t.alloc(TypeKind::TemplateLiteral(vec![prefix, s]));

        let hit = lit_str(&mut t, "id-123");
        let miss = lit_str(&mut t, "user-123");
        assert!(is_extendable(&t, hit, template));
        assert!(!is_extendable(&t, miss, template));
        // string only fits a fully unconstrained template
        assert!(!is_extendable(&t, s, template));
        assert!(is_extendable(&t, template, s));
    }

    #[test]
    fn test_index_access_object() {
        let mut t = Types::new();
        let n = t.alloc(TypeKind::Number(None));
        let a = prop_sig(&mut t, "a", n, false);
        let obj = t.alloc(TypeKind::ObjectLiteral(vec![a]));
        let key = lit_str(&mut t, "a");
        let got = index_access(&mut t, obj, key);
        assert!(matches!(t.kind(got), TypeKind::Number(None)));

        let missing = lit_str(&mut t, "zzz");
        let got = index_access(&mut t, obj, missing);
        assert!(t.is_never(got));
    }

    #[test]
    fn test_index_access_optional_adds_undefined() {
        let mut t = Types::new();
        let n = t.alloc(TypeKind::Number(None));
        let a = prop_sig(&mut t, "a", n, true);
        let obj = t.alloc(TypeKind::ObjectLiteral(vec![a]));
        let key = lit_str(&mut t, "a");
        let got = index_access(&mut t, obj, key);
        match t.kind(got) {
            TypeKind::Union(members) => {
                assert_eq!(members.len(), 2);
                assert!(matches!(t.kind(members[1]), TypeKind::Undefined));
            }
            other => panic!("expected union, got {:?}", other)
        }
    }

    #[test]
    fn test_index_access_union_key() {
        let mut t = Types::new();
        let n = t.alloc(TypeKind::Number(None));
        let s = t.alloc(TypeKind::String);
        let a = prop_sig(&mut t, "a", n, false);
        let b = prop_sig(&mut t, "b", s, false);
        let obj = t.alloc(TypeKind::ObjectLiteral(vec![a, b]));
        let ka = lit_str(&mut t, "a");
        let kb = lit_str(&mut t, "b");
        let keys = t.alloc(TypeKind::Union(vec![ka, kb]));
        let got = index_access(&mut t, obj, keys);
        match t.kind(got) {
            TypeKind::Union(members) => assert_eq!(members.len(), 2),
            other => panic!("expected union, got {:?}", other)
        }
    }

    #[test]
    fn test_index_access_tuple_and_array() {
        let mut t = Types::new();
        let s = t.alloc(TypeKind::String);
        let n = t.alloc(TypeKind::Number(None));
        let m1 = t.alloc(TypeKind::TupleMember { ty: s, name: None, optional: false });
        let m2 = t.alloc(TypeKind::TupleMember { ty: n, name: None, optional: false });
        let tuple = t.alloc(TypeKind::Tuple(vec![m1, m2]));

        let zero = lit_num(&mut t, 0.0);
        let r0 = index_access(&mut t, tuple, zero);
        assert!(matches!(t.kind(r0), TypeKind::String));

        let num = t.alloc(TypeKind::Number(None));
        let all = index_access(&mut t, tuple, num);
        assert!(matches!(t.kind(all), TypeKind::Union(_)));

        let arr = t.alloc(TypeKind::Array(s));
        let idx = lit_num(&mut t, 7.0);
        let r1 = index_access(&mut t, arr, idx);
        assert!(matches!(t.kind(r1), TypeKind::String));
    }

    #[test]
    fn test_index_signature_access() {
        let mut t = Types::new();
        let s = t.alloc(TypeKind::String);
        let n = t.alloc(TypeKind::Number(None));
        let sig = t.alloc(TypeKind::IndexSignature { index: s, ty: n });
        let obj = t.alloc(TypeKind::ObjectLiteral(vec![sig]));

        let key = t.alloc(TypeKind::String);
        let r0 = index_access(&mut t, obj, key);
        assert!(matches!(t.kind(r0), TypeKind::Number(None)));
        let num_key = t.alloc(TypeKind::Number(None));
        let r1 = index_access(&mut t, obj, num_key);
        assert!(t.is_never(r1));
    }
}
