// runtype: runtime reflection for structural type graphs.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

extern crate enumflags2;
#[macro_use]
extern crate lazy_static;
extern crate regex;
extern crate serde;
extern crate serde_json;

#[macro_use]
pub mod util;
pub mod extendable;
pub mod host;
pub mod infer;
pub mod ops;
pub mod packed;
pub mod types;
pub mod vm;

use std::cell::RefCell;
use std::rc::Rc;

use crate::infer::Value;
use crate::packed::Packed;
use crate::types::TypeId;
use crate::vm::{Processor, ReflectOptions, Result};


// The machine is single-threaded by construction (graphs are Rc
// based), so the process-wide default is one machine per thread.
thread_local! {
    static PROCESSOR: RefCell<Processor> = RefCell::new(Processor::new());
}

// Run `f` against the thread's default machine.
pub fn with_processor<R>(f: impl FnOnce(&mut Processor) -> R) -> R {
    PROCESSOR.with(|cell| f(&mut cell.borrow_mut()))
}

pub fn reflect(
    packed: &Rc<Packed>,
    inputs: Vec<TypeId>,
    options: ReflectOptions
) -> Result<TypeId> {
    with_processor(|processor| processor.reflect(packed, inputs, options))
}

pub fn resolve_runtime_type(packed: &Rc<Packed>, inputs: Vec<TypeId>) -> Result<TypeId> {
    with_processor(|processor| processor.resolve_runtime_type(packed, inputs))
}

pub fn type_infer(value: &Value) -> Result<TypeId> {
    with_processor(|processor| processor.type_infer(value))
}
