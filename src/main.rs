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

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;

use mxvm::config::Paths;
use mxvm::emit;
use mxvm::error::Error;
use mxvm::parser::Loader;
use mxvm::program::link;
use mxvm::validate::validate;
use mxvm::vm::{Stdio, VM};

// Exit codes: 1 parse, 2 validate/link, 3 runtime; a clean run passes
// the program's own exit value through.
const EXIT_PARSE: i32 = 1;
const EXIT_LINK: i32 = 2;
const EXIT_RUNTIME: i32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Action {
    Interpret,
    Translate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Target {
    #[value(name = "x86_64_linux")]
    X8664Linux,
}

#[derive(Parser, Debug)]
#[command(name = "mxvm", about = "MXVM virtual machine and translator")]
struct Args {
    /// What to do with the source file.
    #[arg(short, long, value_enum, default_value_t = Action::Interpret)]
    action: Action,

    /// Assembly output file (translate only).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Code generation target.
    #[arg(short, long, value_enum, default_value_t = Target::X8664Linux)]
    target: Target,

    /// RON file with search paths.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the module search directory.
    #[arg(long)]
    module_path: Option<PathBuf>,

    /// Override the object search directory.
    #[arg(long)]
    object_path: Option<PathBuf>,

    /// Override the system include directory.
    #[arg(long)]
    include_path: Option<PathBuf>,

    /// IR source file.
    source: PathBuf,
}

fn load_paths(args: &Args) -> Result<Paths, Error> {
    let mut paths = match &args.config {
        Some(file) => Paths::load(file)?,
        None => {
            let default = Path::new("mxvm.ron");
            if default.exists() {
                Paths::load(default)?
            } else {
                Paths::default()
            }
        }
    };
    if let Some(dir) = &args.module_path {
        paths.module_path = dir.clone();
    }
    if let Some(dir) = &args.object_path {
        paths.object_path = dir.clone();
    }
    if let Some(dir) = &args.include_path {
        paths.include_path = dir.clone();
    }
    Ok(paths)
}

fn run(args: &Args) -> Result<i32, (i32, Error)> {
    let paths = load_paths(args).map_err(|e| (EXIT_PARSE, e))?;

    let mut loader = Loader::new(paths.clone());
    let mut program = loader
        .load(&args.source)
        .map_err(|e| (EXIT_PARSE, e))?;
    validate(&mut program).map_err(|e| (EXIT_LINK, e))?;
    let mut image = link(program).map_err(|e| (EXIT_LINK, e))?;

    match args.action {
        Action::Interpret => {
            let mut console = Stdio;
            let mut vm = VM::new(&mut image, &paths);
            let code = vm.exec(&mut console).map_err(|e| (EXIT_RUNTIME, e))?;
            Ok((code & 0xff) as i32)
        }
        Action::Translate => {
            let output = args.output.clone().ok_or_else(|| {
                (
                    EXIT_LINK,
                    Error::Internal("translate requires --output".to_string()),
                )
            })?;
            let Target::X8664Linux = args.target;
            let text = emit::emit(&image).map_err(|e| (EXIT_LINK, e))?;
            fs::write(&output, text).map_err(|e| (EXIT_RUNTIME, Error::Io(e)))?;
            Ok(0)
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(code) => process::exit(code),
        Err((code, error)) => {
            eprintln!("mxvm: {}", error);
            process::exit(code);
        }
    }
}
