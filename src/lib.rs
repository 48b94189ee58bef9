// Ensure each result error is either unwrapped or returned
#![deny(unused_must_use)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[macro_use]
extern crate num_derive;

pub mod script;

pub use script::exec::native::install_builtins;
pub use script::{run, Diagnostic, ErrorKind, ExecutionContext};

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

pub fn read_script(path: &str) -> io::Result<String> {
    let mut file = File::open(path)?;

    // Use seek to get length of file
    let length = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;

    let mut source = String::with_capacity(length as usize);
    file.read_to_string(&mut source)?;

    Ok(source)
}
