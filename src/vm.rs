// (C) 2020 Brandon Lewis
//
// A virtual machine that reconstructs structural type graphs from
// encoded type programs at runtime.
//
// *Execution Model*
//
// A program consists of a flat opcode stream and a constant pool
// (see packed.rs). Execution is stack-based: opcode handlers pop
// operands, build type nodes in the arena, and push node handles.
//
// Programs chain. When a handler needs the result of another program
// (an inlined alias, a referenced class, an inferred object), it does
// not recurse on the host stack: it allocates the nested program's
// result node up front, pushes that handle onto its own operand
// stack, and makes the nested program current. The dispatch loop runs
// the nested program to completion, which patches the handed-out node
// in place, and then resumes the outer program. The same mechanism
// breaks cycles: reflecting a program that is already on the chain
// hands out one more placeholder to be patched when the outer run
// finishes.
//
// *Frames*
//
// A frame records the stack length at entry, how many variable slots
// were declared inside it, and the type arguments in scope. Frames
// are a plain vector; `loads` addresses ancestors by offset.
//
// Subroutine calls push a return address cell below the frame.
// Return addresses are plain indices into the op stream, so a caller
// can ask to be "returned onto" the opcode that issued the call: the
// distributive and mapped-type opcodes use a negative jump-back
// offset to replay themselves once per member of the type they
// iterate over.
//
// *Validity*
//
// The set of runtime errors is represented by the Error enum in this
// file. All are non-recoverable: an error discards the resolution in
// progress.

use std::convert::TryFrom;
use std::rc::Rc;

use crate::extendable::{extends_with_inference, index_access, Captured, InferAssignments};
use crate::host::HostObject;
use crate::infer::Value;
use crate::ops::{modifier_set, MappedModifier, NumberBrandKind, Op};
use crate::packed::{Packed, PackedEntry, Unpacked};
use crate::types::{
    format_number, AnnotationValue, Annotations, Builtin, ClassRef, DefaultValue, EnumValue,
    Literal, TypeId, TypeKind, Types, Visibility,
};


pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    // reflect() on something with no attached program.
    MissingTypeProgram,
    // A classReference thunk produced nothing usable.
    UnresolvedClassThunk,
    // A pop with nothing left to pop: the encoder and the machine
    // disagree about stack discipline.
    StackUnderflow,
    InvalidOpcode(u8),
    // `inline` accepts packs, thunks, and the self-reference marker
    // 0; no other number is a program pointer.
    InvalidProgramPointer(i64),
    // A type operand was expected but a return address was found, a
    // pool entry had the wrong shape, or an address (pool index,
    // jump target, variable slot) points outside the program.
    ExpectedType,
}


// One operand-stack cell: a type handle or a return address.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Cell {
    Type(TypeId),
    Addr(usize),
}


#[derive(Copy, Clone, Debug, Default)]
pub struct ReflectOptions {
    pub reuse_cached: bool,
}

impl ReflectOptions {
    pub fn cached() -> ReflectOptions {
        ReflectOptions { reuse_cached: true }
    }
}


// A predicate that recognizes an annotation-carrying object literal
// inside an intersection and absorbs it into the annotation map.
pub type TypeDecorator = Rc<dyn Fn(&Types, &mut Annotations, TypeId) -> bool>;


// Iterator state driving a distributive conditional or mapped type.
// One member is processed per replay of the owning opcode.
#[derive(Debug)]
struct Loop {
    members: Vec<TypeId>,
    next: usize,
    current: Option<TypeId>,
    collected: Vec<TypeId>,
}

impl Loop {
    fn over(types: &Types, t: TypeId) -> Loop {
        let members = match types.kind(t) {
            TypeKind::Union(members) => members.clone(),
            _ => vec![t]
        };
        Loop {
            members,
            next: 0,
            current: None,
            collected: Vec::new(),
        }
    }

    fn step(&mut self) -> Option<TypeId> {
        if self.next < self.members.len() {
            let t = self.members[self.next];
            self.next += 1;
            self.current = Some(t);
            Some(t)
        } else {
            None
        }
    }
}


#[derive(Debug)]
struct Frame {
    // Stack length at frame entry. For call frames the return
    // address sits just below.
    base: usize,
    // Variable slots declared in this frame, occupying base..base+n.
    variables: usize,
    // Type arguments in scope.
    inputs: Rc<Vec<TypeId>>,
    distributive: Option<Loop>,
    mapped: Option<Loop>,
}


// One program activation.
struct Program {
    unpacked: Rc<Unpacked>,
    stack: Vec<Cell>,
    pc: isize,
    end: usize,
    frames: Vec<Frame>,
    inputs: Rc<Vec<TypeId>>,
    // Pre-allocated node patched in place on completion.
    result_type: TypeId,
    // Further placeholders handed out for this object while it ran.
    result_types: Vec<TypeId>,
    // Carrier identity, for cycle detection and caching.
    object: Option<Rc<Packed>>,
    host: Option<Rc<HostObject>>,
    type_parameters: Vec<TypeId>,
    reuse_cached: bool,
}


// The machine. One per thread is the normal arrangement (lib.rs
// keeps a thread-local default); isolated instances are fine for
// tests.
pub struct Processor {
    pub types: Types,
    programs: Vec<Program>,
    type_decorators: Vec<TypeDecorator>,
    running: bool,
}

impl Processor {
    pub fn new() -> Processor {
        Processor {
            types: Types::new(),
            programs: Vec::new(),
            type_decorators: Vec::new(),
            running: false,
        }
    }

    pub fn register_type_decorator(&mut self, decorator: TypeDecorator) {
        self.type_decorators.push(decorator);
    }

    // Reflect a packed program into a type graph.
    pub fn reflect(
        &mut self,
        packed: &Rc<Packed>,
        inputs: Vec<TypeId>,
        options: ReflectOptions
    ) -> Result<TypeId> {
        let id = self.enqueue_packed(packed, None, inputs, options.reuse_cached)?;
        self.drain()?;
        Ok(id)
    }

    // Reflect with cache reuse on.
    pub fn resolve_runtime_type(
        &mut self,
        packed: &Rc<Packed>,
        inputs: Vec<TypeId>
    ) -> Result<TypeId> {
        self.reflect(packed, inputs, ReflectOptions::cached())
    }

    // Reflect a host class or function carrying a program.
    pub fn reflect_source(
        &mut self,
        source: &Rc<HostObject>,
        inputs: Vec<TypeId>,
        options: ReflectOptions
    ) -> Result<TypeId> {
        let id = self.enqueue_source(source, inputs, options.reuse_cached)?;
        self.drain()?;
        Ok(id)
    }

    pub(crate) fn enqueue_source(
        &mut self,
        host: &Rc<HostObject>,
        inputs: Vec<TypeId>,
        reuse_cached: bool
    ) -> Result<TypeId> {
        let packed = host.program.clone().ok_or(Error::MissingTypeProgram)?;
        self.enqueue_packed(&packed, Some(host.clone()), inputs, reuse_cached)
    }

    // Queue a program, or short-circuit it.
    //
    // A cacheable non-generic carrier that already resolved returns
    // its interned node. A carrier already on the active chain with
    // the same inputs returns a fresh placeholder registered for
    // patching: that is the cycle breaker. Everything else becomes a
    // new current program whose pre-allocated result node is
    // returned.
    pub(crate) fn enqueue_packed(
        &mut self,
        packed: &Rc<Packed>,
        host: Option<Rc<HostObject>>,
        inputs: Vec<TypeId>,
        reuse_cached: bool
    ) -> Result<TypeId> {
        if reuse_cached && inputs.is_empty() {
            if let Some(cached) = packed.cached_type() {
                return Ok(cached);
            }
        }
        for i in 0..self.programs.len() {
            let same_object = match &self.programs[i].object {
                Some(object) => Rc::ptr_eq(object, packed),
                None => false
            };
            if same_object {
                let active_inputs = self.programs[i].inputs.clone();
                if self.inputs_equal(&active_inputs, &inputs) {
                    let placeholder = self.types.alloc(TypeKind::Unknown);
                    self.programs[i].result_types.push(placeholder);
                    return Ok(placeholder);
                }
            }
        }
        let unpacked = packed.unpack()?;
        let result_type = self.types.alloc(TypeKind::Unknown);
        let inputs = Rc::new(inputs);
        let end = unpacked.ops.len();
        self.programs.push(Program {
            unpacked,
            stack: Vec::new(),
            pc: -1,
            end,
            frames: vec![Frame {
                base: 0,
                variables: 0,
                inputs: inputs.clone(),
                distributive: None,
                mapped: None,
            }],
            inputs,
            result_type,
            result_types: Vec::new(),
            object: Some(packed.clone()),
            host,
            type_parameters: Vec::new(),
            reuse_cached,
        });
        Ok(result_type)
    }

    fn inputs_equal(&self, a: &[TypeId], b: &[TypeId]) -> bool {
        a.len() == b.len()
            && a.iter().zip(b.iter()).all(|(&x, &y)| self.types.structural_eq(x, y))
    }

    // Run queued programs to completion. Re-entrant calls (a thunk
    // reflecting during a resolution) just queue; the outer loop
    // picks the work up.
    pub(crate) fn drain(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.running = true;
        let result = self.run_loop();
        self.running = false;
        if result.is_err() {
            // Fail fast: the whole resolution is discarded.
            self.programs.clear();
        }
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            let pi = match self.programs.len() {
                0 => return Ok(()),
                n => n - 1
            };
            let (pc, end) = {
                let program = &mut self.programs[pi];
                program.pc += 1;
                (program.pc, program.end)
            };
            if pc as usize >= end {
                self.complete()?;
                continue;
            }
            let byte = self.programs[pi].unpacked.ops[pc as usize];
            let op = Op::try_from(byte).map_err(Error::InvalidOpcode)?;
            trace!("p{} {:?} {:?} {:?}", pi, pc, op, self.programs[pi].stack);
            self.dispatch(pi, op)?;
        }
    }

    // Finish the current program: narrow the terminal literal, bind
    // the host class, apply deferred decorators, patch every handle
    // handed out for this program, and intern the result if allowed.
    fn complete(&mut self) -> Result<()> {
        let mut program = self.programs.pop().ok_or(Error::StackUnderflow)?;
        let raw = match program.stack.pop() {
            Some(Cell::Type(t)) => t,
            Some(Cell::Addr(_)) => return Err(Error::ExpectedType),
            None => self.types.alloc(TypeKind::Never)
        };
        let result = self.types.narrow_original_literal(raw);

        if let Some(host) = program.host.clone() {
            if let TypeKind::Class { class_type, .. } = &mut self.types.get_mut(result).kind {
                if matches!(class_type, ClassRef::Placeholder) {
                    *class_type = ClassRef::Host(host.clone());
                }
            }
            self.apply_decorator_records(result, &host);
        }

        if program.result_type != result {
            self.types.patch(program.result_type, result);
        }
        for placeholder in program.result_types.drain(..) {
            if placeholder != result && placeholder != program.result_type {
                self.types.patch(placeholder, result);
            }
        }
        if program.reuse_cached && program.inputs.is_empty() {
            if let Some(object) = &program.object {
                object.set_cached_type(program.result_type);
            }
        }
        Ok(())
    }

    // Replay deferred class decorators over the finished graph:
    // property targets annotate the property's type, parameter
    // targets annotate the parameter's type. Payloads are validators.
    fn apply_decorator_records(&mut self, class_id: TypeId, host: &Rc<HostObject>) {
        for record in host.decorators.clone() {
            let member = match self.types.get_member(class_id, &record.property) {
                Some(m) => m,
                None => continue
            };
            let target = match record.parameter_index {
                None => self.types.member_type(member),
                Some(i) => match self.types.kind(member) {
                    TypeKind::Method { parameters, .. }
                    | TypeKind::MethodSignature { parameters, .. } => parameters
                        .get(i)
                        .cloned()
                        .and_then(|p| self.types.member_type(p)),
                    _ => None
                }
            };
            if let Some(ty) = target {
                self.types
                    .get_mut(ty)
                    .annotations
                    .entry(String::from("validation"))
                    .or_insert_with(Vec::new)
                    .push(AnnotationValue::Validator(record.data.clone()));
            }
        }
    }

    // --- stack and frame plumbing ---------------------------------

    fn push(&mut self, pi: usize, cell: Cell) {
        self.programs[pi].stack.push(cell);
    }

    fn push_type(&mut self, pi: usize, id: TypeId) {
        self.push(pi, Cell::Type(id));
    }

    fn push_kind(&mut self, pi: usize, kind: TypeKind) {
        let id = self.types.alloc(kind);
        self.push_type(pi, id);
    }

    fn pop(&mut self, pi: usize) -> Result<Cell> {
        self.programs[pi].stack.pop().ok_or(Error::StackUnderflow)
    }

    fn pop_type(&mut self, pi: usize) -> Result<TypeId> {
        match self.pop(pi)? {
            Cell::Type(t) => Ok(t),
            Cell::Addr(_) => Err(Error::ExpectedType)
        }
    }

    fn eat_param(&mut self, pi: usize) -> Result<u8> {
        let program = &mut self.programs[pi];
        program.pc += 1;
        if program.pc as usize >= program.end {
            return Err(Error::ExpectedType);
        }
        Ok(program.unpacked.ops[program.pc as usize])
    }

    fn pool_entry(&self, pi: usize, index: u8) -> Result<PackedEntry> {
        self.programs[pi]
            .unpacked
            .stack
            .get(index as usize)
            .cloned()
            .ok_or(Error::ExpectedType)
    }

    fn pool_name(&self, pi: usize, index: u8) -> Result<String> {
        match self.pool_entry(pi, index)? {
            PackedEntry::Str(s) => Ok(s.to_string()),
            PackedEntry::Num(n) => Ok(format_number(n)),
            _ => Err(Error::ExpectedType)
        }
    }

    fn current_frame_index(&self, pi: usize) -> Result<usize> {
        let len = self.programs[pi].frames.len();
        if len == 0 {
            return Err(Error::StackUnderflow);
        }
        Ok(len - 1)
    }

    // The frame `offset` hops up from the current one.
    fn frame_at(&self, pi: usize, offset: u8) -> Result<usize> {
        let len = self.programs[pi].frames.len();
        if (offset as usize) >= len {
            return Err(Error::ExpectedType);
        }
        Ok(len - 1 - offset as usize)
    }

    fn push_frame(&mut self, pi: usize) {
        let program = &mut self.programs[pi];
        let inputs = program
            .frames
            .last()
            .map(|f| f.inputs.clone())
            .unwrap_or_else(|| program.inputs.clone());
        let base = program.stack.len();
        program.frames.push(Frame {
            base,
            variables: 0,
            inputs,
            distributive: None,
            mapped: None,
        });
    }

    // Push the return address, open a call frame, and branch. The
    // jump-back offset is relative to the current (post-parameter)
    // position: +1 resumes after the call site, a negative offset
    // replays the issuing opcode.
    fn call_op(&mut self, pi: usize, target: usize, jump_back: isize) -> Result<()> {
        let return_address = self.programs[pi].pc + jump_back;
        if return_address < 0 {
            return Err(Error::ExpectedType);
        }
        self.push(pi, Cell::Addr(return_address as usize));
        self.push_frame(pi);
        self.programs[pi].pc = target as isize - 1;
        Ok(())
    }

    fn return_op(&mut self, pi: usize) -> Result<()> {
        let value = self.pop(pi)?;
        let program = &mut self.programs[pi];
        let frame = program.frames.pop().ok_or(Error::StackUnderflow)?;
        if frame.base == 0 {
            return Err(Error::StackUnderflow);
        }
        let return_address = match program.stack.get(frame.base - 1) {
            Some(Cell::Addr(a)) => *a,
            _ => return Err(Error::ExpectedType)
        };
        program.stack.truncate(frame.base - 1);
        program.stack.push(value);
        program.pc = return_address as isize - 1;
        Ok(())
    }

    // Close the current frame, yielding the values it produced
    // (excluding its variable slots) and restoring the stack.
    fn pop_frame(&mut self, pi: usize) -> Result<(Frame, Vec<TypeId>)> {
        let program = &mut self.programs[pi];
        let frame = program.frames.pop().ok_or(Error::StackUnderflow)?;
        let start = frame.base + frame.variables;
        if start > program.stack.len() {
            return Err(Error::StackUnderflow);
        }
        let cells: Vec<Cell> = program.stack.drain(start..).collect();
        program.stack.truncate(frame.base);
        let mut values = Vec::with_capacity(cells.len());
        for cell in cells {
            match cell {
                Cell::Type(t) => values.push(t),
                Cell::Addr(_) => return Err(Error::ExpectedType)
            }
        }
        Ok((frame, values))
    }

    fn truthy(&self, cell: &Cell) -> bool {
        match cell {
            Cell::Addr(a) => *a != 0,
            Cell::Type(t) => match self.types.kind(*t) {
                TypeKind::Literal(Literal::Bool(b)) => *b,
                TypeKind::Literal(Literal::Num(n)) => *n != 0.0,
                TypeKind::Literal(Literal::BigInt(n)) => *n != 0,
                TypeKind::Literal(Literal::Str(s)) => !s.is_empty(),
                TypeKind::Never | TypeKind::Undefined | TypeKind::Null => false,
                _ => true
            }
        }
    }

    pub(crate) fn builtin_class(
        &mut self,
        builtin: Builtin,
        type_arguments: Vec<TypeId>
    ) -> TypeId {
        let id = self.types.alloc(TypeKind::Class {
            class_type: ClassRef::Builtin(builtin),
            members: Vec::new(),
            arguments: Vec::new(),
            extends_arguments: Vec::new(),
        });
        self.types.get_mut(id).type_arguments = type_arguments.clone();
        self.types.adopt_all(&type_arguments, id);
        id
    }

    // --- dispatch -------------------------------------------------

    fn dispatch(&mut self, pi: usize, op: Op) -> Result<()> {
        match op {
            Op::Never => self.push_kind(pi, TypeKind::Never),
            Op::Any => self.push_kind(pi, TypeKind::Any),
            Op::Unknown => self.push_kind(pi, TypeKind::Unknown),
            Op::Void => self.push_kind(pi, TypeKind::Void),
            Op::Object => self.push_kind(pi, TypeKind::Object),
            Op::String => self.push_kind(pi, TypeKind::String),
            Op::Number => self.push_kind(pi, TypeKind::Number(None)),
            Op::Boolean => self.push_kind(pi, TypeKind::Boolean),
            Op::BigInt => self.push_kind(pi, TypeKind::BigInt),
            Op::Symbol => self.push_kind(pi, TypeKind::Symbol),
            Op::Null => self.push_kind(pi, TypeKind::Null),
            Op::Undefined => self.push_kind(pi, TypeKind::Undefined),
            Op::Regexp => self.push_kind(pi, TypeKind::Regexp),

            Op::Date => self.push_builtin(pi, Builtin::Date),
            Op::Int8Array => self.push_builtin(pi, Builtin::Int8Array),
            Op::Uint8ClampedArray => self.push_builtin(pi, Builtin::Uint8ClampedArray),
            Op::Uint8Array => self.push_builtin(pi, Builtin::Uint8Array),
            Op::Int16Array => self.push_builtin(pi, Builtin::Int16Array),
            Op::Uint16Array => self.push_builtin(pi, Builtin::Uint16Array),
            Op::Int32Array => self.push_builtin(pi, Builtin::Int32Array),
            Op::Uint32Array => self.push_builtin(pi, Builtin::Uint32Array),
            Op::Float32Array => self.push_builtin(pi, Builtin::Float32Array),
            Op::Float64Array => self.push_builtin(pi, Builtin::Float64Array),
            Op::BigInt64Array => self.push_builtin(pi, Builtin::BigInt64Array),
            Op::ArrayBuffer => self.push_builtin(pi, Builtin::ArrayBuffer),

            Op::Literal => self.op_literal(pi)?,
            Op::NumberBrand => self.op_number_brand(pi)?,
            Op::TemplateLiteral => self.op_template_literal(pi)?,

            Op::Array => {
                let elem = self.pop_type(pi)?;
                let id = self.types.alloc(TypeKind::Array(elem));
                self.types.adopt(elem, id);
                self.push_type(pi, id);
            }
            Op::Tuple => self.op_tuple(pi)?,
            Op::TupleMember => {
                let ty = self.pop_type(pi)?;
                let id = self.types.alloc(TypeKind::TupleMember {
                    ty,
                    name: None,
                    optional: false,
                });
                self.types.adopt(ty, id);
                self.push_type(pi, id);
            }
            Op::NamedTupleMember => {
                let index = self.eat_param(pi)?;
                let name = self.pool_name(pi, index)?;
                let ty = self.pop_type(pi)?;
                let id = self.types.alloc(TypeKind::TupleMember {
                    ty,
                    name: Some(name),
                    optional: false,
                });
                self.types.adopt(ty, id);
                self.push_type(pi, id);
            }
            Op::Rest => {
                let ty = self.pop_type(pi)?;
                let id = self.types.alloc(TypeKind::Rest(ty));
                self.types.adopt(ty, id);
                self.push_type(pi, id);
            }

            Op::Set => {
                let elem = self.pop_type(pi)?;
                let id = self.builtin_class(Builtin::Set, vec![elem]);
                self.push_type(pi, id);
            }
            Op::Map => {
                let value = self.pop_type(pi)?;
                let key = self.pop_type(pi)?;
                let id = self.builtin_class(Builtin::Map, vec![key, value]);
                self.push_type(pi, id);
            }
            Op::Promise => {
                let ty = self.pop_type(pi)?;
                let id = self.types.alloc(TypeKind::Promise(ty));
                self.types.adopt(ty, id);
                self.push_type(pi, id);
            }

            Op::Property => self.op_property(pi, true)?,
            Op::PropertySignature => self.op_property(pi, false)?,
            Op::Method => self.op_method(pi, true)?,
            Op::MethodSignature => self.op_method(pi, false)?,
            Op::Parameter => {
                let index = self.eat_param(pi)?;
                let name = self.pool_name(pi, index)?;
                let ty = self.pop_type(pi)?;
                let id = self.types.alloc(TypeKind::Parameter {
                    name,
                    ty,
                    optional: false,
                    readonly: false,
                    visibility: None,
                    default: None,
                });
                self.types.adopt(ty, id);
                self.push_type(pi, id);
            }
            Op::Function => self.op_function(pi)?,

            Op::Optional => self.mutate_top(pi, |kind| match kind {
                TypeKind::Property { optional, .. }
                | TypeKind::PropertySignature { optional, .. }
                | TypeKind::Method { optional, .. }
                | TypeKind::MethodSignature { optional, .. }
                | TypeKind::TupleMember { optional, .. }
                | TypeKind::Parameter { optional, .. } => *optional = true,
                _ => {}
            })?,
            Op::Readonly => self.mutate_top(pi, |kind| match kind {
                TypeKind::Property { readonly, .. }
                | TypeKind::PropertySignature { readonly, .. }
                | TypeKind::Parameter { readonly, .. } => *readonly = true,
                _ => {}
            })?,
            Op::Public => self.set_visibility(pi, Visibility::Public)?,
            Op::Protected => self.set_visibility(pi, Visibility::Protected)?,
            Op::Private => self.set_visibility(pi, Visibility::Private)?,
            Op::Abstract => self.mutate_top(pi, |kind| {
                if let TypeKind::Method { is_abstract, .. } = kind {
                    *is_abstract = true;
                }
            })?,
            Op::DefaultValue => self.op_default_value(pi)?,
            Op::Description => self.op_description(pi)?,

            Op::IndexSignature => {
                let ty = self.pop_type(pi)?;
                let index = self.pop_type(pi)?;
                let id = self.types.alloc(TypeKind::IndexSignature { index, ty });
                self.types.adopt(ty, id);
                self.types.adopt(index, id);
                self.push_type(pi, id);
            }
            Op::ObjectLiteral => self.op_object_literal(pi)?,
            Op::Class => self.op_class(pi)?,
            Op::ClassExtends => self.op_class_extends(pi)?,
            Op::ClassReference => self.op_class_reference(pi)?,
            Op::Enum => self.op_enum(pi)?,
            Op::EnumMember => {
                let index = self.eat_param(pi)?;
                let name = self.pool_name(pi, index)?;
                self.push_kind(pi, TypeKind::EnumMember { name, default: None });
            }

            Op::Union => {
                let (_, members) = self.pop_frame(pi)?;
                let id = self.types.make_union(members);
                self.push_type(pi, id);
            }
            Op::Intersection => self.op_intersection(pi)?,

            Op::TypeParameter => self.op_type_parameter(pi, false)?,
            Op::TypeParameterDefault => self.op_type_parameter(pi, true)?,
            Op::Var => {
                let fi = self.current_frame_index(pi)?;
                self.programs[pi].frames[fi].variables += 1;
                self.push_kind(pi, TypeKind::Never);
            }
            Op::Loads => {
                let offset = self.eat_param(pi)?;
                let index = self.eat_param(pi)?;
                let fi = self.frame_at(pi, offset)?;
                let slot = self.programs[pi].frames[fi].base + index as usize;
                let cell = self.programs[pi]
                    .stack
                    .get(slot)
                    .cloned()
                    .ok_or(Error::ExpectedType)?;
                self.push(pi, cell);
            }
            Op::Arg => {
                let n = self.eat_param(pi)?;
                let fi = self.current_frame_index(pi)?;
                let base = self.programs[pi].frames[fi].base;
                let slot = base.checked_sub(1 + n as usize).ok_or(Error::StackUnderflow)?;
                let cell = self.programs[pi]
                    .stack
                    .get(slot)
                    .cloned()
                    .ok_or(Error::StackUnderflow)?;
                self.push(pi, cell);
            }
            Op::Infer => {
                let frame_offset = self.eat_param(pi)?;
                let index = self.eat_param(pi)?;
                self.push_kind(pi, TypeKind::Infer {
                    frame_offset,
                    index: index as u16,
                });
            }

            Op::Extends => self.op_extends(pi)?,
            Op::Condition => {
                let right = self.pop_type(pi)?;
                let left = self.pop_type(pi)?;
                let condition = self.pop(pi)?;
                let _ = self.pop_frame(pi)?;
                let chosen = if self.truthy(&condition) { left } else { right };
                self.push_type(pi, chosen);
            }
            Op::JumpCondition => {
                let then_target = self.eat_param(pi)?;
                let else_target = self.eat_param(pi)?;
                let condition = self.pop(pi)?;
                let target = if self.truthy(&condition) {
                    then_target
                } else {
                    else_target
                };
                self.call_op(pi, target as usize, 1)?;
            }
            Op::Jump => {
                let target = self.eat_param(pi)?;
                self.programs[pi].pc = target as isize - 1;
            }
            Op::Call => {
                let target = self.eat_param(pi)?;
                self.call_op(pi, target as usize, 1)?;
            }
            Op::Frame => self.push_frame(pi),
            Op::MoveFrame => {
                let value = self.pop(pi)?;
                let frame = self.programs[pi].frames.pop().ok_or(Error::StackUnderflow)?;
                self.programs[pi].stack.truncate(frame.base);
                self.push(pi, value);
            }
            Op::Return => self.return_op(pi)?,
            Op::Distribute => self.op_distribute(pi)?,
            Op::MappedType => self.op_mapped_type(pi)?,

            Op::IndexAccess => {
                let index = self.pop_type(pi)?;
                let container = self.pop_type(pi)?;
                let raw = index_access(&mut self.types, container, index);
                let result = self.types.alloc_copy(raw);
                self.types.get_mut(result).index_access_origin = Some((container, index));
                self.push_type(pi, result);
            }
            Op::Keyof => self.op_keyof(pi)?,
            Op::Typeof => {
                let index = self.eat_param(pi)?;
                match self.pool_entry(pi, index)? {
                    PackedEntry::Thunk(thunk) => {
                        let value = thunk();
                        let id = self.infer_value(&value)?;
                        self.push_type(pi, id);
                    }
                    _ => return Err(Error::ExpectedType)
                }
            }
            Op::Widen => {
                let t = self.pop_type(pi)?;
                let id = self.types.widen_literal(t);
                self.push_type(pi, id);
            }

            Op::Inline => self.op_inline(pi)?,
            Op::InlineCall => self.op_inline_call(pi)?,
        }
        Ok(())
    }

    // --- opcode handlers ------------------------------------------

    fn push_builtin(&mut self, pi: usize, builtin: Builtin) {
        let id = self.builtin_class(builtin, vec![]);
        self.push_type(pi, id);
    }

    fn op_literal(&mut self, pi: usize) -> Result<()> {
        let index = self.eat_param(pi)?;
        let kind = match self.pool_entry(pi, index)? {
            PackedEntry::Str(s) => TypeKind::Literal(Literal::Str(s)),
            PackedEntry::Num(n) => TypeKind::Literal(Literal::Num(n)),
            PackedEntry::Bool(b) => TypeKind::Literal(Literal::Bool(b)),
            PackedEntry::Regex(r) => TypeKind::Literal(Literal::Regex(r)),
            PackedEntry::Thunk(thunk) => match thunk() {
                Value::Str(s) => TypeKind::Literal(Literal::Str(s)),
                Value::Num(n) => TypeKind::Literal(Literal::Num(n)),
                Value::Bool(b) => TypeKind::Literal(Literal::Bool(b)),
                Value::BigInt(n) => TypeKind::Literal(Literal::BigInt(n)),
                Value::Regex(r) => TypeKind::Literal(Literal::Regex(r)),
                Value::Null => TypeKind::Null,
                Value::Undefined => TypeKind::Undefined,
                _ => return Err(Error::ExpectedType)
            },
            PackedEntry::Pack(_) => return Err(Error::ExpectedType)
        };
        self.push_kind(pi, kind);
        Ok(())
    }

    fn op_number_brand(&mut self, pi: usize) -> Result<()> {
        let param = self.eat_param(pi)?;
        let brand =
            NumberBrandKind::from_param(param).ok_or(Error::InvalidOpcode(param))?;
        self.push_kind(pi, TypeKind::Number(Some(brand)));
        Ok(())
    }

    // Cartesian product of the parts' union expansions; adjacent
    // literal runs concatenate; an all-literal combination collapses
    // to one string literal.
    fn op_template_literal(&mut self, pi: usize) -> Result<()> {
        let (_, parts) = self.pop_frame(pi)?;
        let expansions: Vec<Vec<TypeId>> = parts
            .iter()
            .map(|&p| match self.types.kind(p) {
                TypeKind::Union(members) => members.clone(),
                _ => vec![p]
            })
            .collect();
        let mut combos: Vec<Vec<TypeId>> = vec![Vec::new()];
        for expansion in &expansions {
            let mut next = Vec::new();
            for combo in &combos {
                for &option in expansion {
                    let mut grown = combo.clone();
                    grown.push(option);
                    next.push(grown);
                }
            }
            combos = next;
        }
        let mut results = Vec::new();
        for combo in combos {
            results.push(self.build_template(combo));
        }
        let union = self.types.make_union(results);
        self.push_type(pi, union);
        Ok(())
    }

    fn build_template(&mut self, parts: Vec<TypeId>) -> TypeId {
        enum Part {
            Text(String),
            Node(TypeId),
        }
        // Nested templates splice in place.
        let mut flat = Vec::new();
        for p in parts {
            match self.types.kind(p) {
                TypeKind::TemplateLiteral(inner) => flat.extend(inner.clone()),
                _ => flat.push(p)
            }
        }
        let mut merged: Vec<Part> = Vec::new();
        for p in flat {
            match self.types.kind(p) {
                TypeKind::Literal(l) => {
                    let text = l.to_text();
                    if let Some(Part::Text(prev)) = merged.last_mut() {
                        prev.push_str(&text);
                    } else {
                        merged.push(Part::Text(text));
                    }
                }
                _ => merged.push(Part::Node(p))
            }
        }
        match merged.len() {
            0 => self
                .types
                .alloc(TypeKind::Literal(Literal::Str(Rc::new(String::new())))),
            1 => match merged.remove(0) {
                Part::Text(s) => {
                    self.types.alloc(TypeKind::Literal(Literal::Str(Rc::new(s))))
                }
                Part::Node(n) => {
                    if matches!(self.types.kind(n), TypeKind::String) {
                        self.types.alloc(TypeKind::String)
                    } else {
                        let id = self.types.alloc(TypeKind::TemplateLiteral(vec![n]));
                        self.types.adopt(n, id);
                        id
                    }
                }
            },
            _ => {
                let mut ids = Vec::with_capacity(merged.len());
                for part in merged {
                    match part {
                        Part::Text(s) => ids.push(
                            self.types.alloc(TypeKind::Literal(Literal::Str(Rc::new(s)))),
                        ),
                        Part::Node(n) => ids.push(n)
                    }
                }
                let id = self.types.alloc(TypeKind::TemplateLiteral(ids.clone()));
                self.types.adopt_all(&ids, id);
                id
            }
        }
    }

    // A rest member holding a concrete tuple splices in place.
    fn op_tuple(&mut self, pi: usize) -> Result<()> {
        let (_, members) = self.pop_frame(pi)?;
        let mut spliced = Vec::new();
        for m in members {
            let inner = match self.types.kind(m) {
                TypeKind::TupleMember { ty, .. } => match self.types.kind(*ty) {
                    TypeKind::Rest(r) => Some(*r),
                    _ => None
                },
                TypeKind::Rest(r) => Some(*r),
                _ => None
            };
            match inner {
                Some(r) => match self.types.kind(r) {
                    TypeKind::Tuple(inner_members) => spliced.extend(inner_members.clone()),
                    _ => spliced.push(m)
                },
                None => spliced.push(m)
            }
        }
        let id = self.types.alloc(TypeKind::Tuple(spliced.clone()));
        self.types.adopt_all(&spliced, id);
        self.push_type(pi, id);
        Ok(())
    }

    fn op_property(&mut self, pi: usize, class_member: bool) -> Result<()> {
        let index = self.eat_param(pi)?;
        let name = self.pool_name(pi, index)?;
        let raw = self.pop_type(pi)?;
        let (ty, optional) = self.unwrap_undefined_union(raw);
        let kind = if class_member {
            TypeKind::Property {
                name,
                ty,
                optional,
                readonly: false,
                visibility: Visibility::Public,
                default: None,
                description: None,
            }
        } else {
            TypeKind::PropertySignature {
                name,
                ty,
                optional,
                readonly: false,
                default: None,
                description: None,
            }
        };
        let id = self.types.alloc(kind);
        self.types.adopt(ty, id);
        self.push_type(pi, id);
        Ok(())
    }

    // `T | undefined` members are really optional members of `T`.
    fn unwrap_undefined_union(&mut self, t: TypeId) -> (TypeId, bool) {
        if let TypeKind::Union(members) = self.types.kind(t) {
            let members = members.clone();
            let kept: Vec<TypeId> = members
                .iter()
                .cloned()
                .filter(|&m| !matches!(self.types.kind(m), TypeKind::Undefined))
                .collect();
            if kept.len() < members.len() {
                let unwrapped = self.types.make_union(kept);
                return (unwrapped, true);
            }
        }
        (t, false)
    }

    fn op_method(&mut self, pi: usize, class_member: bool) -> Result<()> {
        let index = self.eat_param(pi)?;
        let name = self.pool_name(pi, index)?;
        let (_, mut values) = self.pop_frame(pi)?;
        let ret = values.pop().ok_or(Error::StackUnderflow)?;
        let parameters = values;
        let kind = if class_member {
            TypeKind::Method {
                name,
                parameters: parameters.clone(),
                ret,
                visibility: Visibility::Public,
                is_abstract: false,
                optional: false,
            }
        } else {
            TypeKind::MethodSignature {
                name,
                parameters: parameters.clone(),
                ret,
                optional: false,
            }
        };
        let id = self.types.alloc(kind);
        self.types.adopt_all(&parameters, id);
        self.types.adopt(ret, id);
        self.push_type(pi, id);
        Ok(())
    }

    fn op_function(&mut self, pi: usize) -> Result<()> {
        let index = self.eat_param(pi)?;
        let name = self.pool_name(pi, index)?;
        let (_, mut values) = self.pop_frame(pi)?;
        let ret = values.pop().ok_or(Error::StackUnderflow)?;
        let parameters = values;
        let id = self.types.alloc(TypeKind::Function {
            name: if name.is_empty() { None } else { Some(name) },
            parameters: parameters.clone(),
            ret,
        });
        self.types.adopt_all(&parameters, id);
        self.types.adopt(ret, id);
        self.push_type(pi, id);
        Ok(())
    }

    fn mutate_top(&mut self, pi: usize, f: impl FnOnce(&mut TypeKind)) -> Result<()> {
        let top = match self.programs[pi].stack.last() {
            Some(Cell::Type(t)) => *t,
            Some(Cell::Addr(_)) => return Err(Error::ExpectedType),
            None => return Err(Error::StackUnderflow)
        };
        f(&mut self.types.get_mut(top).kind);
        Ok(())
    }

    fn set_visibility(&mut self, pi: usize, visibility: Visibility) -> Result<()> {
        self.mutate_top(pi, |kind| match kind {
            TypeKind::Property { visibility: v, .. } => *v = visibility,
            TypeKind::Method { visibility: v, .. } => *v = visibility,
            TypeKind::Parameter { visibility: v, .. } => *v = Some(visibility),
            _ => {}
        })
    }

    fn op_default_value(&mut self, pi: usize) -> Result<()> {
        let index = self.eat_param(pi)?;
        let default = match self.pool_entry(pi, index)? {
            PackedEntry::Thunk(thunk) => DefaultValue(thunk),
            PackedEntry::Num(n) => DefaultValue(Rc::new(move || Value::Num(n))),
            PackedEntry::Bool(b) => DefaultValue(Rc::new(move || Value::Bool(b))),
            PackedEntry::Str(s) => DefaultValue(Rc::new(move || Value::Str(s.clone()))),
            _ => return Err(Error::ExpectedType)
        };
        self.mutate_top(pi, move |kind| match kind {
            TypeKind::Property { default: d, .. }
            | TypeKind::PropertySignature { default: d, .. }
            | TypeKind::Parameter { default: d, .. }
            | TypeKind::EnumMember { default: d, .. } => *d = Some(default),
            _ => {}
        })
    }

    fn op_description(&mut self, pi: usize) -> Result<()> {
        let index = self.eat_param(pi)?;
        let text = self.pool_name(pi, index)?;
        self.mutate_top(pi, move |kind| match kind {
            TypeKind::Property { description, .. }
            | TypeKind::PropertySignature { description, .. } => *description = Some(text),
            _ => {}
        })
    }

    // Collect the frame into an object literal: index signatures and
    // member signatures directly, nested object literals spread in
    // (extends clauses), annotation literals absorbed. Duplicate
    // names are replaced.
    fn op_object_literal(&mut self, pi: usize) -> Result<()> {
        let (_, values) = self.pop_frame(pi)?;
        let mut members: Vec<TypeId> = Vec::new();
        let mut annotations = Annotations::new();
        let mut decorators = Vec::new();
        for v in values {
            match self.types.kind(v) {
                TypeKind::ObjectLiteral(_) => {
                    if self.run_type_decorators(&mut annotations, v) {
                        decorators.push(v);
                        continue;
                    }
                    for m in self.types.members_of(v).to_vec() {
                        add_member(&self.types, &mut members, m);
                    }
                }
                TypeKind::Property { .. }
                | TypeKind::PropertySignature { .. }
                | TypeKind::Method { .. }
                | TypeKind::MethodSignature { .. }
                | TypeKind::IndexSignature { .. } => {
                    add_member(&self.types, &mut members, v);
                }
                _ => {}
            }
        }
        let id = self.types.alloc(TypeKind::ObjectLiteral(members.clone()));
        self.types.adopt_all(&members, id);
        {
            let node = self.types.get_mut(id);
            for (key, values) in annotations {
                node.annotations.entry(key).or_insert_with(Vec::new).extend(values);
            }
            node.decorators = decorators;
        }
        self.push_type(pi, id);
        Ok(())
    }

    fn run_type_decorators(&self, annotations: &mut Annotations, t: TypeId) -> bool {
        for decorator in &self.type_decorators {
            if decorator(&self.types, annotations, t) {
                return true;
            }
        }
        false
    }

    // Build a class node. Constructor parameters carrying a
    // visibility modifier are promoted to properties. Generic
    // arguments come from the frame's inputs, or from the unbound
    // parameter record for an uninstantiated generic class.
    fn op_class(&mut self, pi: usize) -> Result<()> {
        let inputs = {
            let program = &self.programs[pi];
            program.frames.last().ok_or(Error::StackUnderflow)?.inputs.clone()
        };
        let (_, values) = self.pop_frame(pi)?;
        let mut members = values;
        let mut promoted = Vec::new();
        for index in 0..members.len() {
            let m = members[index];
            let (name, parameters) = match self.types.kind(m) {
                TypeKind::Method { name, parameters, .. } => (name.clone(), parameters.clone()),
                _ => continue
            };
            if name != "constructor" {
                continue;
            }
            for param in parameters {
                let kind = self.types.kind(param).clone();
                if let TypeKind::Parameter {
                    name,
                    ty,
                    optional,
                    readonly,
                    visibility: Some(visibility),
                    default,
                } = kind
                {
                    let prop = self.types.alloc(TypeKind::Property {
                        name,
                        ty,
                        optional,
                        readonly,
                        visibility,
                        default,
                        description: None,
                    });
                    promoted.push(prop);
                }
            }
        }
        members.extend(promoted);
        let type_arguments = if !inputs.is_empty() {
            inputs.as_ref().clone()
        } else {
            self.programs[pi].type_parameters.clone()
        };
        let id = self.types.alloc(TypeKind::Class {
            class_type: ClassRef::Placeholder,
            members: members.clone(),
            arguments: Vec::new(),
            extends_arguments: Vec::new(),
        });
        self.types.adopt_all(&members, id);
        self.types.get_mut(id).type_arguments = type_arguments;
        self.push_type(pi, id);
        Ok(())
    }

    fn op_class_extends(&mut self, pi: usize) -> Result<()> {
        let n = self.eat_param(pi)?;
        let mut arguments = Vec::with_capacity(n as usize);
        for _ in 0..n {
            arguments.push(self.pop_type(pi)?);
        }
        arguments.reverse();
        let top = match self.programs[pi].stack.last() {
            Some(Cell::Type(t)) => *t,
            _ => return Err(Error::StackUnderflow)
        };
        if let TypeKind::Class { extends_arguments, .. } = &mut self.types.get_mut(top).kind {
            *extends_arguments = arguments;
        }
        Ok(())
    }

    fn resolve_host_thunk(&self, entry: PackedEntry) -> Result<Rc<HostObject>> {
        match entry {
            PackedEntry::Thunk(thunk) => match thunk() {
                Value::Class(host) | Value::Function(host) | Value::Instance(host) => Ok(host),
                _ => Err(Error::UnresolvedClassThunk)
            },
            _ => Err(Error::ExpectedType)
        }
    }

    fn op_class_reference(&mut self, pi: usize) -> Result<()> {
        let index = self.eat_param(pi)?;
        let entry = self.pool_entry(pi, index)?;
        let (_, arguments) = self.pop_frame(pi)?;
        let host = self.resolve_host_thunk(entry)?;
        match host.program.clone() {
            None => {
                let id = self.types.alloc(TypeKind::Class {
                    class_type: ClassRef::Host(host.clone()),
                    members: Vec::new(),
                    arguments: Vec::new(),
                    extends_arguments: Vec::new(),
                });
                let node = self.types.get_mut(id);
                node.type_name = Some(host.name.clone());
                node.type_arguments = arguments;
                self.push_type(pi, id);
            }
            Some(packed) => {
                let id =
                    self.enqueue_packed(&packed, Some(host.clone()), arguments.clone(), true)?;
                self.stamp_reference(id, Some(host.name.clone()), arguments);
                self.push_type(pi, id);
            }
        }
        Ok(())
    }

    // Identity metadata survives both caching and deferred patching;
    // only fill what is still blank.
    fn stamp_reference(&mut self, id: TypeId, name: Option<String>, arguments: Vec<TypeId>) {
        let node = self.types.get_mut(id);
        if node.type_name.is_none() {
            node.type_name = name;
        }
        if node.type_arguments.is_empty() {
            node.type_arguments = arguments;
        }
    }

    fn op_enum(&mut self, pi: usize) -> Result<()> {
        let (_, members) = self.pop_frame(pi)?;
        let mut map = Vec::new();
        let mut values = Vec::new();
        // Members without an initializer continue numerically from
        // the previous value, starting at 0.
        let mut previous: Option<f64> = None;
        for m in members {
            let (name, default) = match self.types.kind(m) {
                TypeKind::EnumMember { name, default } => (name.clone(), default.clone()),
                _ => continue
            };
            let value = match default {
                Some(thunk) => match thunk.get() {
                    Value::Num(n) => {
                        previous = Some(n);
                        EnumValue::Num(n)
                    }
                    Value::Str(s) => {
                        previous = None;
                        EnumValue::Str(s.to_string())
                    }
                    _ => {
                        previous = None;
                        EnumValue::Undefined
                    }
                },
                None => {
                    let n = previous.map(|v| v + 1.0).unwrap_or(0.0);
                    previous = Some(n);
                    EnumValue::Num(n)
                }
            };
            map.push((name, value.clone()));
            values.push(value);
        }
        self.push_kind(pi, TypeKind::Enum { map, values });
        Ok(())
    }

    // Intersections: never dominates; annotation literals are lifted
    // out; one primitive-ish candidate wins with leftover aggregates
    // attached as its `default` annotation; otherwise the aggregates
    // merge structurally, falling back to the first candidate when
    // they cannot.
    fn op_intersection(&mut self, pi: usize) -> Result<()> {
        let (_, values) = self.pop_frame(pi)?;
        let flat = self.flatten_intersections(&values);
        if flat.iter().any(|&t| self.types.is_never(t)) {
            self.push_kind(pi, TypeKind::Never);
            return Ok(());
        }
        let mut annotations = Annotations::new();
        let mut decorators = Vec::new();
        let mut structural = Vec::new();
        for t in flat {
            if matches!(self.types.kind(t), TypeKind::ObjectLiteral(_))
                && self.run_type_decorators(&mut annotations, t)
            {
                decorators.push(t);
                continue;
            }
            structural.push(t);
        }
        let primitive = structural
            .iter()
            .position(|&t| is_primitive_candidate(self.types.kind(t)));
        let result = match primitive {
            Some(pos) => {
                let primary = structural[pos];
                for (i, &t) in structural.iter().enumerate() {
                    if i == pos {
                        continue;
                    }
                    if matches!(
                        self.types.kind(t),
                        TypeKind::ObjectLiteral(_) | TypeKind::Class { .. }
                    ) {
                        annotations
                            .entry(String::from("default"))
                            .or_insert_with(Vec::new)
                            .push(AnnotationValue::Type(t));
                    }
                }
                primary
            }
            None if !structural.is_empty() => match self.types.merge(&structural) {
                Some(merged) => merged,
                None => structural[0]
            },
            None => self.types.alloc(TypeKind::Never)
        };
        {
            let node = self.types.get_mut(result);
            for (key, values) in annotations {
                node.annotations.entry(key).or_insert_with(Vec::new).extend(values);
            }
            node.decorators.extend(decorators);
        }
        self.push_type(pi, result);
        Ok(())
    }

    fn flatten_intersections(&self, types: &[TypeId]) -> Vec<TypeId> {
        let mut out = Vec::new();
        for &t in types {
            match self.types.kind(t) {
                TypeKind::Intersection(members) => {
                    let members = members.clone();
                    out.extend(self.flatten_intersections(&members));
                }
                _ => out.push(t)
            }
        }
        out
    }

    fn op_type_parameter(&mut self, pi: usize, with_default: bool) -> Result<()> {
        let index = self.eat_param(pi)?;
        let name = self.pool_name(pi, index)?;
        let fi = self.current_frame_index(pi)?;
        let slot = {
            let frame = &mut self.programs[pi].frames[fi];
            let slot = frame.variables;
            frame.variables += 1;
            slot
        };
        let input = self.programs[pi].frames[fi].inputs.get(slot).cloned();
        if with_default {
            let default = self.pop_type(pi)?;
            match input {
                Some(t) => self.push_type(pi, t),
                None => self.push_type(pi, default)
            }
        } else {
            match input {
                Some(t) => self.push_type(pi, t),
                None => {
                    let sentinel = self.types.alloc(TypeKind::TypeParameter { name });
                    let any = self.types.alloc(TypeKind::Any);
                    self.programs[pi].type_parameters.push(any);
                    self.push_type(pi, sentinel);
                }
            }
        }
        Ok(())
    }

    fn op_extends(&mut self, pi: usize) -> Result<()> {
        let right = self.pop_type(pi)?;
        let left = self.pop_type(pi)?;
        let mut captured = InferAssignments::new();
        let ok = extends_with_inference(&self.types, left, right, &mut captured);
        for (frame_offset, index, capture) in captured {
            let value = match capture {
                Captured::Type(t) => t,
                Captured::Tuple(members) => {
                    let id = self.types.alloc(TypeKind::Tuple(members.clone()));
                    self.types.adopt_all(&members, id);
                    id
                }
            };
            let fi = self.frame_at(pi, frame_offset)?;
            let slot = self.programs[pi].frames[fi].base + index as usize;
            let program = &mut self.programs[pi];
            if slot >= program.stack.len() {
                return Err(Error::ExpectedType);
            }
            program.stack[slot] = Cell::Type(value);
        }
        self.push_kind(pi, TypeKind::Literal(Literal::Bool(ok)));
        Ok(())
    }

    // Distributive conditional. First entry installs the member
    // iterator; each member is written into the frame's variable
    // slot and the body is called with a jump-back that replays this
    // opcode, which collects the produced type and advances.
    fn op_distribute(&mut self, pi: usize) -> Result<()> {
        let body = self.eat_param(pi)?;
        let fi = self.current_frame_index(pi)?;
        if self.programs[pi].frames[fi].distributive.is_none() {
            let over = self.pop_type(pi)?;
            let l = Loop::over(&self.types, over);
            self.programs[pi].frames[fi].distributive = Some(l);
        } else {
            let result = self.pop_type(pi)?;
            if !self.types.is_never(result) {
                if let Some(l) = self.programs[pi].frames[fi].distributive.as_mut() {
                    l.collected.push(result);
                }
            }
        }
        let next = match self.programs[pi].frames[fi].distributive.as_mut() {
            Some(l) => l.step(),
            None => None
        };
        match next {
            Some(member) => {
                let slot = self.programs[pi].frames[fi].base;
                let program = &mut self.programs[pi];
                if slot >= program.stack.len() {
                    return Err(Error::StackUnderflow);
                }
                program.stack[slot] = Cell::Type(member);
                self.call_op(pi, body as usize, -1)?;
            }
            None => {
                let (frame, _) = self.pop_frame(pi)?;
                let collected = frame
                    .distributive
                    .map(|l| l.collected)
                    .unwrap_or_else(Vec::new);
                let union = self.types.make_union(collected);
                self.push_type(pi, union);
            }
        }
        Ok(())
    }

    // Mapped type `{[K in U]: ...}`. Same replay shape as
    // distribute, two parameter slots wide.
    fn op_mapped_type(&mut self, pi: usize) -> Result<()> {
        let body = self.eat_param(pi)?;
        let modifiers = self.eat_param(pi)?;
        let fi = self.current_frame_index(pi)?;
        if self.programs[pi].frames[fi].mapped.is_none() {
            let over = self.pop_type(pi)?;
            let l = Loop::over(&self.types, over);
            self.programs[pi].frames[fi].mapped = Some(l);
        } else {
            let value = self.pop_type(pi)?;
            let key = self.programs[pi].frames[fi]
                .mapped
                .as_ref()
                .and_then(|l| l.current)
                .ok_or(Error::StackUnderflow)?;
            if let Some(member) = self.mapped_member(key, value, modifiers)? {
                if let Some(l) = self.programs[pi].frames[fi].mapped.as_mut() {
                    l.collected.push(member);
                }
            }
        }
        let next = match self.programs[pi].frames[fi].mapped.as_mut() {
            Some(l) => l.step(),
            None => None
        };
        match next {
            Some(key) => {
                let slot = self.programs[pi].frames[fi].base;
                let program = &mut self.programs[pi];
                if slot >= program.stack.len() {
                    return Err(Error::StackUnderflow);
                }
                program.stack[slot] = Cell::Type(key);
                self.call_op(pi, body as usize, -2)?;
            }
            None => {
                let (frame, _) = self.pop_frame(pi)?;
                let members = frame.mapped.map(|l| l.collected).unwrap_or_else(Vec::new);
                let id = self.types.alloc(TypeKind::ObjectLiteral(members.clone()));
                self.types.adopt_all(&members, id);
                self.push_type(pi, id);
            }
        }
        Ok(())
    }

    // One mapped-type emission. A primitive key domain produces an
    // index signature; a never value drops the key; otherwise a
    // property signature, with the modifier bits applied.
    fn mapped_member(
        &mut self,
        key: TypeId,
        value: TypeId,
        modifiers: u8
    ) -> Result<Option<TypeId>> {
        let primitive_domain = matches!(
            self.types.kind(key),
            TypeKind::String | TypeKind::Number(_) | TypeKind::Symbol
        );
        if primitive_domain {
            let sig = self.types.alloc(TypeKind::IndexSignature { index: key, ty: value });
            self.types.adopt(key, sig);
            self.types.adopt(value, sig);
            return Ok(Some(sig));
        }
        if self.types.is_never(value) {
            return Ok(None);
        }
        let member = if matches!(self.types.kind(value), TypeKind::PropertySignature { .. }) {
            if let TypeKind::Literal(Literal::Str(key_name)) = self.types.kind(key) {
                let key_name = key_name.to_string();
                if let TypeKind::PropertySignature { name, .. } =
                    &mut self.types.get_mut(value).kind
                {
                    *name = key_name;
                }
            }
            value
        } else {
            let name = match self.types.kind(key) {
                TypeKind::Literal(l) => l.to_text(),
                _ => return Ok(None)
            };
            let id = self.types.alloc(TypeKind::PropertySignature {
                name,
                ty: value,
                optional: false,
                readonly: false,
                default: None,
                description: None,
            });
            self.types.adopt(value, id);
            id
        };
        let set = modifier_set(modifiers);
        self.mutate_member_flags(member, |optional, readonly| {
            if set.contains(MappedModifier::Optional) {
                *optional = true;
            }
            if set.contains(MappedModifier::RemoveOptional) {
                *optional = false;
            }
            if set.contains(MappedModifier::Readonly) {
                *readonly = true;
            }
            if set.contains(MappedModifier::RemoveReadonly) {
                *readonly = false;
            }
        });
        Ok(Some(member))
    }

    fn mutate_member_flags(&mut self, member: TypeId, f: impl FnOnce(&mut bool, &mut bool)) {
        match &mut self.types.get_mut(member).kind {
            TypeKind::PropertySignature { optional, readonly, .. }
            | TypeKind::Property { optional, readonly, .. } => f(optional, readonly),
            _ => {}
        }
    }

    fn op_keyof(&mut self, pi: usize) -> Result<()> {
        let t = self.pop_type(pi)?;
        match self.types.kind(t) {
            TypeKind::ObjectLiteral(_) | TypeKind::Class { .. } => {
                let members = self.types.members_of(t).to_vec();
                let mut names = Vec::new();
                for m in members {
                    if let Some(name) = self.types.member_name(m) {
                        let name = String::from(name);
                        names.push(
                            self.types.alloc(TypeKind::Literal(Literal::Str(Rc::new(name)))),
                        );
                    }
                }
                let union = self.types.make_union(names);
                self.push_type(pi, union);
            }
            _ => self.push_kind(pi, TypeKind::Never)
        }
        Ok(())
    }

    fn op_inline(&mut self, pi: usize) -> Result<()> {
        let index = self.eat_param(pi)?;
        let entry = self.pool_entry(pi, index)?;
        // A terminal inline is a cacheable alias resolution.
        let reuse = {
            let program = &self.programs[pi];
            program.pc as usize == program.end - 1
        };
        match entry {
            PackedEntry::Num(n) => {
                if n == 0.0 {
                    let result_type = self.programs[pi].result_type;
                    self.push_type(pi, result_type);
                    Ok(())
                } else {
                    Err(Error::InvalidProgramPointer(n as i64))
                }
            }
            PackedEntry::Pack(packed) => {
                let id = self.enqueue_packed(&packed, None, vec![], reuse)?;
                self.push_type(pi, id);
                Ok(())
            }
            PackedEntry::Thunk(_) => {
                let host = self.resolve_host_thunk(entry)?;
                let id = self.enqueue_source(&host, vec![], reuse)?;
                self.stamp_reference(id, Some(host.name.clone()), vec![]);
                self.push_type(pi, id);
                Ok(())
            }
            _ => Err(Error::ExpectedType)
        }
    }

    // Instantiate a referenced program with explicit arguments. A
    // popped `never` in position i forwards this program's own input
    // i; the self-reference marker re-runs this very program with
    // the new arguments.
    fn op_inline_call(&mut self, pi: usize) -> Result<()> {
        let index = self.eat_param(pi)?;
        let count = self.eat_param(pi)?;
        let mut arguments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            arguments.push(self.pop_type(pi)?);
        }
        arguments.reverse();
        let own_inputs = self.programs[pi].inputs.clone();
        for (i, argument) in arguments.iter_mut().enumerate() {
            if self.types.is_never(*argument) {
                if let Some(&forwarded) = own_inputs.get(i) {
                    *argument = forwarded;
                }
            }
        }
        let entry = self.pool_entry(pi, index)?;
        let (packed, host) = match entry {
            PackedEntry::Num(n) => {
                if n == 0.0 {
                    let packed = self.programs[pi]
                        .object
                        .clone()
                        .ok_or(Error::MissingTypeProgram)?;
                    (packed, self.programs[pi].host.clone())
                } else {
                    return Err(Error::InvalidProgramPointer(n as i64));
                }
            }
            PackedEntry::Pack(packed) => (packed, None),
            PackedEntry::Thunk(_) => {
                let host = self.resolve_host_thunk(entry)?;
                let packed = host.program.clone().ok_or(Error::MissingTypeProgram)?;
                (packed, Some(host))
            }
            _ => return Err(Error::ExpectedType)
        };
        let id = self.enqueue_packed(&packed, host.clone(), arguments.clone(), false)?;
        self.stamp_reference(id, host.map(|h| h.name.clone()), arguments);
        self.push_type(pi, id);
        Ok(())
    }
}


// Insert a member, replacing an existing member of the same name.
fn add_member(types: &Types, members: &mut Vec<TypeId>, member: TypeId) {
    let name = match types.member_name(member) {
        Some(n) => String::from(n),
        None => {
            members.push(member);
            return;
        }
    };
    match members.iter().position(|&m| types.member_name(m) == Some(name.as_str())) {
        Some(i) => members[i] = member,
        None => members.push(member)
    }
}

// One primitive-ish intersection candidate dominates the result.
fn is_primitive_candidate(kind: &TypeKind) -> bool {
    matches!(
        kind,
        TypeKind::String
            | TypeKind::Number(_)
            | TypeKind::Boolean
            | TypeKind::BigInt
            | TypeKind::Symbol
            | TypeKind::Regexp
            | TypeKind::Literal(_)
            | TypeKind::TemplateLiteral(_)
            | TypeKind::Array(_)
            | TypeKind::Tuple(_)
            | TypeKind::Any
    )
}
