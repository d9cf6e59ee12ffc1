// mxvm: featherweight virtual-machine toolchain.
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

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod ast;
pub mod config;
pub mod emit;
pub mod error;
pub mod ffi;
pub mod inst;
pub mod lexer;
pub mod parser;
pub mod program;
pub mod validate;
pub mod vm;
