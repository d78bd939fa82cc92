// The type graph.
//
// Reflection produces graphs of type nodes. Nodes live in an arena and
// reference each other by index, which keeps self-referential types
// (an interface whose property is the interface itself) representable
// without aliasing tricks: the interpreter allocates a node id up
// front, hands it out, and fills the slot in when the producing
// program completes.
//
// `parent` back-references form a tree, except where recursion closes
// a cycle; a parent link is a lookup relation, not ownership, so a
// cyclic graph is just more indices.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use regex::Regex;

use crate::host::{HostObject, Validator};
use crate::infer::Value;
use crate::ops::NumberBrandKind;


// A handle into the arena. Comparing handles is identity comparison;
// `Types::structural_eq` compares shape.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}


// Literal payloads. Regex literals compare by pattern text, since the
// compiled program has no useful equality.
#[derive(Clone, Debug)]
pub enum Literal {
    Str(Rc<String>),
    Num(f64),
    Bool(bool),
    BigInt(i64),
    Regex(Rc<Regex>),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Literal) -> bool {
        match (self, other) {
            (Literal::Str(a), Literal::Str(b)) => a == b,
            (Literal::Num(a), Literal::Num(b)) => a == b,
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::BigInt(a), Literal::BigInt(b)) => a == b,
            (Literal::Regex(a), Literal::Regex(b)) => a.as_str() == b.as_str(),
            (_, _) => false
        }
    }
}

impl Literal {
    // The text a literal contributes to a template literal.
    pub fn to_text(&self) -> String {
        match self {
            Literal::Str(s) => s.to_string(),
            Literal::Num(n) => format_number(*n),
            Literal::Bool(b) => b.to_string(),
            Literal::BigInt(n) => n.to_string(),
            Literal::Regex(r) => format!("/{}/", r.as_str()),
        }
    }
}

// Numbers print without a trailing fraction when they hold an integral
// value, matching the host language's string conversion.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum EnumValue {
    Num(f64),
    Str(String),
    Undefined,
}


// Built-in host classes the instruction set can reference without a
// thunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Builtin {
    Date,
    Set,
    Map,
    ArrayBuffer,
    Int8Array,
    Uint8ClampedArray,
    Uint8Array,
    Int16Array,
    Uint16Array,
    Int32Array,
    Uint32Array,
    Float32Array,
    Float64Array,
    BigInt64Array,
}


// What a class node points at. `Placeholder` means "the class whose
// program produced this node"; it is overwritten with the host handle
// when that program terminates.
#[derive(Clone, Debug)]
pub enum ClassRef {
    Placeholder,
    Builtin(Builtin),
    Host(Rc<HostObject>),
}

impl ClassRef {
    // Nominal identity: two references to the same concrete class.
    // Placeholders are anonymous and never nominally equal.
    pub fn same_host(&self, other: &ClassRef) -> bool {
        match (self, other) {
            (ClassRef::Builtin(a), ClassRef::Builtin(b)) => a == b,
            (ClassRef::Host(a), ClassRef::Host(b)) => Rc::ptr_eq(a, b),
            (_, _) => false
        }
    }

    fn same(&self, other: &ClassRef) -> bool {
        match (self, other) {
            (ClassRef::Placeholder, ClassRef::Placeholder) => true,
            (ClassRef::Builtin(a), ClassRef::Builtin(b)) => a == b,
            (ClassRef::Host(a), ClassRef::Host(b)) => Rc::ptr_eq(a, b),
            (_, _) => false
        }
    }
}


// A deferred default value. Kept as a thunk because defaults may be
// arbitrarily expensive to produce and are rarely needed.
#[derive(Clone)]
pub struct DefaultValue(pub Rc<dyn Fn() -> Value>);

impl DefaultValue {
    pub fn get(&self) -> Value {
        (self.0)()
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<default>")
    }
}


// Opaque payloads hung off a node under a named annotation.
#[derive(Clone)]
pub enum AnnotationValue {
    Type(TypeId),
    Validator(Validator),
}

impl fmt::Debug for AnnotationValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AnnotationValue::Type(id) => write!(f, "Type({:?})", id),
            AnnotationValue::Validator(_) => write!(f, "<validator>"),
        }
    }
}

pub type Annotations = HashMap<String, Vec<AnnotationValue>>;


// The tag that picks a node's shape.
#[derive(Clone, Debug)]
pub enum TypeKind {
    Never,
    Any,
    Unknown,
    Void,
    Object,
    String,
    Number(Option<NumberBrandKind>),
    Boolean,
    BigInt,
    Symbol,
    Null,
    Undefined,
    Regexp,
    Literal(Literal),
    TemplateLiteral(Vec<TypeId>),
    Array(TypeId),
    Tuple(Vec<TypeId>),
    TupleMember {
        ty: TypeId,
        name: Option<String>,
        optional: bool,
    },
    Rest(TypeId),
    ObjectLiteral(Vec<TypeId>),
    Class {
        class_type: ClassRef,
        members: Vec<TypeId>,
        arguments: Vec<TypeId>,
        extends_arguments: Vec<TypeId>,
    },
    Enum {
        map: Vec<(String, EnumValue)>,
        values: Vec<EnumValue>,
    },
    EnumMember {
        name: String,
        default: Option<DefaultValue>,
    },
    Function {
        name: Option<String>,
        parameters: Vec<TypeId>,
        ret: TypeId,
    },
    Method {
        name: String,
        parameters: Vec<TypeId>,
        ret: TypeId,
        visibility: Visibility,
        is_abstract: bool,
        optional: bool,
    },
    MethodSignature {
        name: String,
        parameters: Vec<TypeId>,
        ret: TypeId,
        optional: bool,
    },
    Property {
        name: String,
        ty: TypeId,
        optional: bool,
        readonly: bool,
        visibility: Visibility,
        default: Option<DefaultValue>,
        description: Option<String>,
    },
    PropertySignature {
        name: String,
        ty: TypeId,
        optional: bool,
        readonly: bool,
        default: Option<DefaultValue>,
        description: Option<String>,
    },
    IndexSignature {
        index: TypeId,
        ty: TypeId,
    },
    Parameter {
        name: String,
        ty: TypeId,
        optional: bool,
        readonly: bool,
        visibility: Option<Visibility>,
        default: Option<DefaultValue>,
    },
    Union(Vec<TypeId>),
    Intersection(Vec<TypeId>),
    Promise(TypeId),
    TypeParameter {
        name: String,
    },
    Infer {
        frame_offset: u8,
        index: u16,
    },
}


// One node. The cross-cutting fields ride alongside the kind so any
// variant can carry identity metadata and annotations.
#[derive(Clone, Debug)]
pub struct Type {
    pub kind: TypeKind,
    pub parent: Option<TypeId>,
    pub type_name: Option<String>,
    pub type_arguments: Vec<TypeId>,
    pub annotations: Annotations,
    pub decorators: Vec<TypeId>,
    pub index_access_origin: Option<(TypeId, TypeId)>,
    pub origin: Option<Literal>,
}

impl Type {
    fn new(kind: TypeKind) -> Type {
        Type {
            kind,
            parent: None,
            type_name: None,
            type_arguments: Vec::new(),
            annotations: Annotations::new(),
            decorators: Vec::new(),
            index_access_origin: None,
            origin: None,
        }
    }
}


// The arena.
pub struct Types {
    nodes: Vec<Type>,
}

impl Types {
    pub fn new() -> Types {
        Types { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn alloc(&mut self, kind: TypeKind) -> TypeId {
        let id = TypeId(self.nodes.len() as u32);
        self.nodes.push(Type::new(kind));
        id
    }

    // Shallow copy: same kind and children handles, fresh identity.
    pub fn alloc_copy(&mut self, source: TypeId) -> TypeId {
        let node = self.get(source).clone();
        let id = TypeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.nodes[id.0 as usize]
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.get(id).kind
    }

    pub fn is_never(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Never)
    }

    // Record `parent` as the container of `child`.
    pub fn adopt(&mut self, child: TypeId, parent: TypeId) {
        self.get_mut(child).parent = Some(parent);
    }

    pub fn adopt_all(&mut self, children: &[TypeId], parent: TypeId) {
        for &child in children {
            self.adopt(child, parent);
        }
    }

    // The handles a node directly contains, in member order.
    pub fn children_of(&self, id: TypeId) -> Vec<TypeId> {
        use TypeKind::*;
        match self.kind(id) {
            TemplateLiteral(parts) => parts.clone(),
            Array(elem) => vec![*elem],
            Tuple(members) => members.clone(),
            TupleMember { ty, .. } => vec![*ty],
            Rest(ty) => vec![*ty],
            ObjectLiteral(members) => members.clone(),
            Class { members, extends_arguments, .. } => {
                let mut out = members.clone();
                out.extend_from_slice(extends_arguments);
                out
            }
            Function { parameters, ret, .. } => {
                let mut out = parameters.clone();
                out.push(*ret);
                out
            }
            Method { parameters, ret, .. } => {
                let mut out = parameters.clone();
                out.push(*ret);
                out
            }
            MethodSignature { parameters, ret, .. } => {
                let mut out = parameters.clone();
                out.push(*ret);
                out
            }
            Property { ty, .. } => vec![*ty],
            PropertySignature { ty, .. } => vec![*ty],
            IndexSignature { index, ty } => vec![*index, *ty],
            Parameter { ty, .. } => vec![*ty],
            Union(members) => members.clone(),
            Intersection(members) => members.clone(),
            Promise(ty) => vec![*ty],
            _ => Vec::new()
        }
    }

    // Overwrite `target` with the content of `source`, in place.
    //
    // The target keeps its parent and any identity metadata already
    // stamped on it; direct children are re-parented onto the target
    // so the graph reads consistently through the patched handle.
    pub fn patch(&mut self, target: TypeId, source: TypeId) {
        if target == source {
            return;
        }
        let replacement = self.get(source).clone();
        let dst = &mut self.nodes[target.0 as usize];
        let parent = dst.parent;
        let type_name = dst.type_name.take();
        let type_arguments = std::mem::replace(&mut dst.type_arguments, Vec::new());
        *dst = replacement;
        dst.parent = parent;
        if type_name.is_some() {
            dst.type_name = type_name;
        }
        if !type_arguments.is_empty() {
            dst.type_arguments = type_arguments;
        }
        for child in self.children_of(target) {
            self.adopt(child, target);
        }
    }

    // The named members of an aggregate.
    pub fn members_of(&self, id: TypeId) -> &[TypeId] {
        match self.kind(id) {
            TypeKind::ObjectLiteral(members) => members,
            TypeKind::Class { members, .. } => members,
            _ => &[]
        }
    }

    pub fn member_name(&self, id: TypeId) -> Option<&str> {
        match self.kind(id) {
            TypeKind::Property { name, .. } => Some(name),
            TypeKind::PropertySignature { name, .. } => Some(name),
            TypeKind::Method { name, .. } => Some(name),
            TypeKind::MethodSignature { name, .. } => Some(name),
            TypeKind::EnumMember { name, .. } => Some(name),
            TypeKind::TupleMember { name, .. } => name.as_ref().map(|n| n.as_str()),
            _ => None
        }
    }

    // The type a member contributes, when it has one.
    pub fn member_type(&self, id: TypeId) -> Option<TypeId> {
        match self.kind(id) {
            TypeKind::Property { ty, .. } => Some(*ty),
            TypeKind::PropertySignature { ty, .. } => Some(*ty),
            TypeKind::TupleMember { ty, .. } => Some(*ty),
            TypeKind::Parameter { ty, .. } => Some(*ty),
            _ => None
        }
    }

    pub fn member_optional(&self, id: TypeId) -> bool {
        match self.kind(id) {
            TypeKind::Property { optional, .. } => *optional,
            TypeKind::PropertySignature { optional, .. } => *optional,
            TypeKind::MethodSignature { optional, .. } => *optional,
            TypeKind::Method { optional, .. } => *optional,
            TypeKind::TupleMember { optional, .. } => *optional,
            _ => false
        }
    }

    pub fn get_member(&self, id: TypeId, name: &str) -> Option<TypeId> {
        self.members_of(id)
            .iter()
            .cloned()
            .find(|&m| self.member_name(m) == Some(name))
    }

    pub fn get_annotations(&self, id: TypeId) -> &Annotations {
        &self.get(id).annotations
    }

    // Expand nested unions into one flat member list.
    pub fn flatten_union_types(&self, types: &[TypeId]) -> Vec<TypeId> {
        let mut out = Vec::new();
        for &t in types {
            match self.kind(t) {
                TypeKind::Union(members) => {
                    let members = members.clone();
                    out.extend(self.flatten_union_types(&members));
                }
                _ => out.push(t)
            }
        }
        out
    }

    // Membership by structural equality.
    pub fn is_type_included(&self, list: &[TypeId], t: TypeId) -> bool {
        list.iter().any(|&other| self.structural_eq(other, t))
    }

    // A union with one member is that member.
    pub fn unbox_union(&self, u: TypeId) -> TypeId {
        match self.kind(u) {
            TypeKind::Union(members) if members.len() == 1 => members[0],
            _ => u
        }
    }

    // The normalized union of `candidates`: flattened, `never` dropped,
    // members pairwise distinct, singletons unboxed.
    pub fn make_union(&mut self, candidates: Vec<TypeId>) -> TypeId {
        let flat = self.flatten_union_types(&candidates);
        let mut members: Vec<TypeId> = Vec::new();
        for t in flat {
            if self.is_never(t) {
                continue;
            }
            if !self.is_type_included(&members, t) {
                members.push(t);
            }
        }
        match members.len() {
            0 => self.alloc(TypeKind::Never),
            1 => members[0],
            _ => {
                let u = self.alloc(TypeKind::Union(members.clone()));
                self.adopt_all(&members, u);
                u
            }
        }
    }

    // Replace a literal with its base primitive. The literal rides
    // along as `origin` so a terminal result can be narrowed back.
    pub fn widen_literal(&mut self, t: TypeId) -> TypeId {
        let literal = match self.kind(t) {
            TypeKind::Literal(l) => l.clone(),
            _ => return t
        };
        let kind = match &literal {
            Literal::Str(_) => TypeKind::String,
            Literal::Num(_) => TypeKind::Number(None),
            Literal::Bool(_) => TypeKind::Boolean,
            Literal::BigInt(_) => TypeKind::BigInt,
            Literal::Regex(_) => TypeKind::Regexp,
        };
        let id = self.alloc(kind);
        self.get_mut(id).origin = Some(literal);
        id
    }

    // The inverse of widening, for terminal result nodes only.
    pub fn narrow_original_literal(&mut self, t: TypeId) -> TypeId {
        let widened = matches!(
            self.kind(t),
            TypeKind::String
                | TypeKind::Number(_)
                | TypeKind::Boolean
                | TypeKind::BigInt
                | TypeKind::Regexp
        );
        if !widened {
            return t;
        }
        match self.get(t).origin.clone() {
            Some(literal) => self.alloc(TypeKind::Literal(literal)),
            None => t
        }
    }

    // Structural merge for intersections: members from later candidates
    // override earlier ones by name, index signatures concatenate.
    //
    // Returns None when a candidate is not mergeable (not an object
    // literal or class).
    pub fn merge(&mut self, candidates: &[TypeId]) -> Option<TypeId> {
        let mut members: Vec<TypeId> = Vec::new();
        for &candidate in candidates {
            match self.kind(candidate) {
                TypeKind::ObjectLiteral(_) | TypeKind::Class { .. } => {}
                _ => return None
            }
            for member in self.members_of(candidate).to_vec() {
                if matches!(self.kind(member), TypeKind::IndexSignature { .. }) {
                    members.push(member);
                    continue;
                }
                let name = match self.member_name(member) {
                    Some(n) => n.to_string(),
                    None => {
                        members.push(member);
                        continue;
                    }
                };
                match members.iter().position(|&m| self.member_name(m) == Some(name.as_str())) {
                    Some(i) => members[i] = member,
                    None => members.push(member)
                }
            }
        }
        let merged = self.alloc(TypeKind::ObjectLiteral(members.clone()));
        self.adopt_all(&members, merged);
        Some(merged)
    }

    // Shape comparison. Identity metadata, parents, annotations and
    // deferred defaults are ignored; cycles compare equal once both
    // sides revisit the same pair.
    pub fn structural_eq(&self, a: TypeId, b: TypeId) -> bool {
        let mut seen = HashSet::new();
        self.eq_inner(a, b, &mut seen)
    }

    fn eq_all(&self, a: &[TypeId], b: &[TypeId], seen: &mut HashSet<(u32, u32)>) -> bool {
        a.len() == b.len()
            && a.iter().zip(b.iter()).all(|(&x, &y)| self.eq_inner(x, y, seen))
    }

    fn eq_inner(&self, a: TypeId, b: TypeId, seen: &mut HashSet<(u32, u32)>) -> bool {
        if a == b {
            return true;
        }
        if !seen.insert((a.0, b.0)) {
            return true;
        }
        use TypeKind::*;
        match (self.kind(a), self.kind(b)) {
            (Never, Never)
            | (Any, Any)
            | (Unknown, Unknown)
            | (Void, Void)
            | (Object, Object)
            | (String, String)
            | (Boolean, Boolean)
            | (BigInt, BigInt)
            | (Symbol, Symbol)
            | (Null, Null)
            | (Undefined, Undefined)
            | (Regexp, Regexp) => true,
            (Number(x), Number(y)) => x == y,
            (Literal(x), Literal(y)) => x == y,
            (TemplateLiteral(x), TemplateLiteral(y)) => self.eq_all(x, y, seen),
            (Array(x), Array(y)) => self.eq_inner(*x, *y, seen),
            (Tuple(x), Tuple(y)) => self.eq_all(x, y, seen),
            (
                TupleMember { ty: xt, name: xn, optional: xo },
                TupleMember { ty: yt, name: yn, optional: yo },
            ) => xn == yn && xo == yo && self.eq_inner(*xt, *yt, seen),
            (Rest(x), Rest(y)) => self.eq_inner(*x, *y, seen),
            (ObjectLiteral(x), ObjectLiteral(y)) => self.eq_all(x, y, seen),
            (
                Class { class_type: xc, members: xm, .. },
                Class { class_type: yc, members: ym, .. },
            ) => xc.same(yc) && self.eq_all(xm, ym, seen),
            (Enum { map: xm, values: xv }, Enum { map: ym, values: yv }) => {
                xm == ym && xv == yv
            }
            (
                EnumMember { name: xn, .. },
                EnumMember { name: yn, .. },
            ) => xn == yn,
            (
                Function { name: xn, parameters: xp, ret: xr },
                Function { name: yn, parameters: yp, ret: yr },
            ) => xn == yn && self.eq_all(xp, yp, seen) && self.eq_inner(*xr, *yr, seen),
            (
                Method { name: xn, parameters: xp, ret: xr, visibility: xv, .. },
                Method { name: yn, parameters: yp, ret: yr, visibility: yv, .. },
            ) => {
                xn == yn
                    && xv == yv
                    && self.eq_all(xp, yp, seen)
                    && self.eq_inner(*xr, *yr, seen)
            }
            (
                MethodSignature { name: xn, parameters: xp, ret: xr, optional: xo },
                MethodSignature { name: yn, parameters: yp, ret: yr, optional: yo },
            ) => {
                xn == yn
                    && xo == yo
                    && self.eq_all(xp, yp, seen)
                    && self.eq_inner(*xr, *yr, seen)
            }
            (
                Property { name: xn, ty: xt, optional: xo, readonly: xw, visibility: xv, .. },
                Property { name: yn, ty: yt, optional: yo, readonly: yw, visibility: yv, .. },
            ) => {
                xn == yn && xo == yo && xw == yw && xv == yv && self.eq_inner(*xt, *yt, seen)
            }
            (
                PropertySignature { name: xn, ty: xt, optional: xo, readonly: xw, .. },
                PropertySignature { name: yn, ty: yt, optional: yo, readonly: yw, .. },
            ) => xn == yn && xo == yo && xw == yw && self.eq_inner(*xt, *yt, seen),
            (
                IndexSignature { index: xi, ty: xt },
                IndexSignature { index: yi, ty: yt },
            ) => self.eq_inner(*xi, *yi, seen) && self.eq_inner(*xt, *yt, seen),
            (
                Parameter { name: xn, ty: xt, optional: xo, .. },
                Parameter { name: yn, ty: yt, optional: yo, .. },
            ) => xn == yn && xo == yo && self.eq_inner(*xt, *yt, seen),
            (Union(x), Union(y)) => self.eq_all(x, y, seen),
            (Intersection(x), Intersection(y)) => self.eq_all(x, y, seen),
            (Promise(x), Promise(y)) => self.eq_inner(*x, *y, seen),
            (TypeParameter { name: x }, TypeParameter { name: y }) => x == y,
            (
                Infer { frame_offset: xf, index: xi },
                Infer { frame_offset: yf, index: yi },
            ) => xf == yf && xi == yi,
            (_, _) => false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn lit_str(types: &mut Types, s: &str) -> TypeId {
        types.alloc(TypeKind::Literal(Literal::Str(Rc::new(String::from(s)))))
    }

    fn lit_num(types: &mut Types, n: f64) -> TypeId {
        types.alloc(TypeKind::Literal(Literal::Num(n)))
    }

    fn prop_sig(types: &mut Types, name: &str, ty: TypeId) -> TypeId {
        types.alloc(TypeKind::PropertySignature {
            name: String::from(name),
            ty,
            optional: false,
            readonly: false,
            default: None,
            description: None,
        })
    }

    #[test]
    fn test_widen_and_narrow() {
        let mut types = Types::new();
        let abc = lit_str(&mut types, "abc");
        let wide = types.widen_literal(abc);
        assert!(matches!(types.kind(wide), TypeKind::String));

        let narrow = types.narrow_original_literal(wide);
        assert!(types.structural_eq(narrow, abc));

        let n = lit_num(&mut types, 42.0);
        let wide = types.widen_literal(n);
        assert!(matches!(types.kind(wide), TypeKind::Number(None)));

        let t = types.alloc(TypeKind::Literal(Literal::Bool(true)));
        let wide = types.widen_literal(t);
        assert!(matches!(types.kind(wide), TypeKind::Boolean));

        let re = types.alloc(TypeKind::Literal(Literal::Regex(Rc::new(
            Regex::new("a+").unwrap(),
        ))));
        let wide = types.widen_literal(re);
        assert!(matches!(types.kind(wide), TypeKind::Regexp));
        let narrow = types.narrow_original_literal(wide);
        assert!(types.structural_eq(narrow, re));

        // Non-literals pass through untouched.
        let s = types.alloc(TypeKind::String);
        assert_eq!(types.widen_literal(s), s);
        assert_eq!(types.narrow_original_literal(s), s);
    }

    #[test]
    fn test_make_union_flattens_and_dedupes() {
        let mut types = Types::new();
        let a = lit_str(&mut types, "a");
        let b = lit_str(&mut types, "b");
        let inner = types.alloc(TypeKind::Union(vec![a, b]));
        let a2 = lit_str(&mut types, "a");
        let never = types.alloc(TypeKind::Never);

        let u = types.make_union(vec![inner, a2, never]);
        match types.kind(u) {
            TypeKind::Union(members) => {
                assert_eq!(members.len(), 2);
                for &m in members {
                    assert!(!matches!(types.kind(m), TypeKind::Union(_)));
                    assert!(!types.is_never(m));
                }
            }
            other => panic!("expected union, got {:?}", other)
        }
    }

    #[test]
    fn test_make_union_unboxes_singleton() {
        let mut types = Types::new();
        let s = types.alloc(TypeKind::String);
        let never = types.alloc(TypeKind::Never);
        assert_eq!(types.make_union(vec![s, never]), s);
    }

    #[test]
    fn test_make_union_of_nothing_is_never() {
        let mut types = Types::new();
        let u = types.make_union(vec![]);
        assert!(types.is_never(u));
    }

    #[test]
    fn test_merge_override_and_index_concat() {
        let mut types = Types::new();
        let num = types.alloc(TypeKind::Number(None));
        let s = types.alloc(TypeKind::String);
        let a1 = prop_sig(&mut types, "a", num);
        let b = prop_sig(&mut types, "b", num);
        let left = types.alloc(TypeKind::ObjectLiteral(vec![a1, b]));

        let a2 = prop_sig(&mut types, "a", s);
        let sig_index = types.alloc(TypeKind::String);
        let sig = types.alloc(TypeKind::IndexSignature { index: sig_index, ty: num });
        let right = types.alloc(TypeKind::ObjectLiteral(vec![a2, sig]));

        let merged = types.merge(&[left, right]).unwrap();
        let members = types.members_of(merged).to_vec();
        assert_eq!(members.len(), 3);
        // "a" kept its position but took the later type.
        assert_eq!(types.member_name(members[0]), Some("a"));
        assert!(types.structural_eq(types.member_type(members[0]).unwrap(), s));
        assert_eq!(types.member_name(members[1]), Some("b"));
        assert!(matches!(types.kind(members[2]), TypeKind::IndexSignature { .. }));
    }

    #[test]
    fn test_merge_rejects_non_objects() {
        let mut types = Types::new();
        let s = types.alloc(TypeKind::String);
        let obj = types.alloc(TypeKind::ObjectLiteral(vec![]));
        assert!(types.merge(&[obj, s]).is_none());
    }

    #[test]
    fn test_structural_eq_cycles() {
        let mut types = Types::new();
        // Two independently-built self-referential object literals.
        let p1 = prop_sig(&mut types, "next", TypeId(0));
        let o1 = types.alloc(TypeKind::ObjectLiteral(vec![p1]));
        match &mut types.get_mut(p1).kind {
            TypeKind::PropertySignature { ty, .. } => *ty = o1,
            _ => unreachable!()
        }

        let p2 = prop_sig(&mut types, "next", TypeId(0));
        let o2 = types.alloc(TypeKind::ObjectLiteral(vec![p2]));
        match &mut types.get_mut(p2).kind {
            TypeKind::PropertySignature { ty, .. } => *ty = o2,
            _ => unreachable!()
        }

        assert!(types.structural_eq(o1, o2));
    }

    #[test]
    fn test_patch_preserves_identity_metadata() {
        let mut types = Types::new();
        let placeholder = types.alloc(TypeKind::Unknown);
        types.get_mut(placeholder).type_name = Some(String::from("Box"));

        let num = types.alloc(TypeKind::Number(None));
        let member = prop_sig(&mut types, "value", num);
        let obj = types.alloc(TypeKind::ObjectLiteral(vec![member]));
        types.adopt(member, obj);

        types.patch(placeholder, obj);
        assert!(matches!(types.kind(placeholder), TypeKind::ObjectLiteral(_)));
        assert_eq!(types.get(placeholder).type_name.as_deref(), Some("Box"));
        // Children now read back to the patched handle.
        assert_eq!(types.get(member).parent, Some(placeholder));
    }

    #[test]
    fn test_get_member() {
        let mut types = Types::new();
        let num = types.alloc(TypeKind::Number(None));
        let a = prop_sig(&mut types, "a", num);
        let obj = types.alloc(TypeKind::ObjectLiteral(vec![a]));
        assert_eq!(types.get_member(obj, "a"), Some(a));
        assert_eq!(types.get_member(obj, "b"), None);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(1.5), "1.5");
    }
}
