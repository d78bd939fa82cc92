// Host interop.
//
// The interpreter talks to host classes and functions through opaque
// handles. The surface is deliberately narrow: a handle exposes its
// attached type program, a display name, and any deferred decorator
// records. Everything else about the host artefact is invisible to
// reflection.

use std::fmt;
use std::rc::Rc;

use crate::infer::Value;
use crate::packed::Packed;


// A decorator payload. Applied payloads are validator predicates over
// runtime values; they end up in the `validation` annotation list of
// the member type they target.
pub type Validator = Rc<dyn Fn(&Value) -> bool>;


// A decorator application captured at class-definition time and
// replayed once the class's type program has produced its graph.
//
// `parameter_index` selects a method parameter target; when absent the
// record targets the named property itself.
#[derive(Clone)]
pub struct DecoratorRecord {
    pub data: Validator,
    pub property: String,
    pub parameter_index: Option<usize>,
}

impl fmt::Debug for DecoratorRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DecoratorRecord({:?}, {:?})",
            self.property, self.parameter_index
        )
    }
}


// What reflection needs to know about a host artefact.
pub trait TypeSource {
    fn program(&self) -> Option<Rc<Packed>>;
    fn name(&self) -> Option<&str>;
    fn decorators(&self) -> &[DecoratorRecord];
}


// The concrete handle for a host class or function.
//
// Handle identity (the `Rc` pointer) is what the interpreter uses to
// recognize re-entrant reflection of the same artefact.
pub struct HostObject {
    pub name: String,
    pub program: Option<Rc<Packed>>,
    pub decorators: Vec<DecoratorRecord>,
}

impl HostObject {
    pub fn new(name: &str, program: Rc<Packed>) -> Rc<HostObject> {
        Rc::new(HostObject {
            name: String::from(name),
            program: Some(program),
            decorators: Vec::new(),
        })
    }

    // A handle with no attached program. Reflecting it directly is an
    // error; referencing it yields a bare class node.
    pub fn bare(name: &str) -> Rc<HostObject> {
        Rc::new(HostObject {
            name: String::from(name),
            program: None,
            decorators: Vec::new(),
        })
    }

    pub fn with_decorators(
        name: &str,
        program: Rc<Packed>,
        decorators: Vec<DecoratorRecord>
    ) -> Rc<HostObject> {
        Rc::new(HostObject {
            name: String::from(name),
            program: Some(program),
            decorators,
        })
    }
}

impl TypeSource for HostObject {
    fn program(&self) -> Option<Rc<Packed>> {
        self.program.clone()
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn decorators(&self) -> &[DecoratorRecord] {
        &self.decorators
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HostObject({:?})", self.name)
    }
}
