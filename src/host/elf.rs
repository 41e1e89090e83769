use crate::error::{ErrorCode, Result};
use goblin::elf::note::NT_GNU_BUILD_ID;
use goblin::elf::Elf;
use std::fs;

/// Extract the GNU build ID from an executable's note segments, for module
/// UUID reporting. Not every binary carries one.
pub fn build_id(path: &str) -> Result<Vec<u8>> {
    let data = fs::read(path).map_err(|_| ErrorCode::NotFound)?;
    let elf = Elf::parse(&data).map_err(|_| ErrorCode::InvalidArgument)?;
    if let Some(notes) = elf.iter_note_headers(&data) {
        for note in notes {
            let note = note.map_err(|_| ErrorCode::InvalidArgument)?;
            if note.n_type == NT_GNU_BUILD_ID && note.name == "GNU" {
                return Ok(note.desc.to_vec());
            }
        }
    }
    Err(ErrorCode::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_elf_input_is_rejected() {
        let path = format!("/tmp/rvds-elf-test-{}", unsafe { libc::getpid() });
        fs::write(&path, b"definitely not an elf").unwrap();
        assert!(build_id(&path).is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_not_found() {
        assert_eq!(build_id("/no/such/elf").unwrap_err(), ErrorCode::NotFound);
    }

    #[test]
    fn own_executable_parses() {
        // The test binary is a valid ELF; whether it carries a build id
        // depends on the linker, so only the parse path is asserted.
        let exe = fs::read_link("/proc/self/exe").unwrap();
        let result = build_id(exe.to_str().unwrap());
        assert!(result.is_ok() || result == Err(ErrorCode::NotFound));
    }
}
