use std::fs;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use data_encoding::HEXLOWER;
use lru::LruCache;
use memmap2::Mmap;
use object::elf::{FileHeader32, FileHeader64, PT_LOAD};
use object::read::elf::FileHeader;
use object::read::elf::ProgramHeader;
use object::Endianness;
use object::FileKind;
use object::Object;
use object::ObjectKind;
use object::ObjectSection;
use parking_lot::Mutex;
use ring::digest::{Context, Digest, SHA256};
use thiserror::Error;

use crate::mappings::Mapping;
use crate::process::Pid;

/// How many object files we keep open at any point in time.
const OBJECT_FILE_CACHE_SIZE: usize = 10;

/// Elf load segments used during address normalization to find the segment
/// an address on disk falls into.
#[derive(Debug, Clone)]
pub struct ElfLoad {
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
}

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("address {addr:#x} is not covered by any load segment")]
    NoSegment { addr: u64 },
    #[error("address {addr:#x} is below the mapping start {start:#x}")]
    BelowMapping { addr: u64, start: u64 },
}

/// A parsed object file backing one or more executable mappings.
#[derive(Debug)]
pub struct ObjectFile {
    pub path: PathBuf,
    pub build_id: String,
    is_dyn: bool,
    elf_loads: Vec<ElfLoad>,
}

impl ObjectFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let object = object::File::parse(&*mmap)?;

        Ok(ObjectFile {
            path: path.to_path_buf(),
            build_id: build_id(&object)?,
            is_dyn: object.kind() == ObjectKind::Dynamic,
            elf_loads: elf_load_segments(&mmap)?,
        })
    }

    /// Translates a runtime address to the address it has in the on-disk
    /// binary. For position independent code this undoes the load bias by
    /// going through the file offset of the containing load segment; for
    /// fixed-address executables the runtime address already is the on-disk
    /// address.
    pub fn obj_addr(&self, addr: u64, mapping: &Mapping) -> Result<u64, NormalizationError> {
        if !self.is_dyn {
            return Ok(addr);
        }

        let offset = addr
            .checked_sub(mapping.start)
            .ok_or(NormalizationError::BelowMapping {
                addr,
                start: mapping.start,
            })?
            + mapping.offset;

        for segment in &self.elf_loads {
            let address_range = segment.p_offset..(segment.p_offset + segment.p_filesz);
            if address_range.contains(&offset) {
                return Ok(offset - segment.p_offset + segment.p_vaddr);
            }
        }

        Err(NormalizationError::NoSegment { addr })
    }

    #[cfg(test)]
    pub fn with_segments(is_dyn: bool, elf_loads: Vec<ElfLoad>) -> Self {
        ObjectFile {
            path: PathBuf::new(),
            build_id: String::new(),
            is_dyn,
            elf_loads,
        }
    }

    #[cfg(test)]
    pub fn with_build_id(path: PathBuf, build_id: String) -> Self {
        ObjectFile {
            path,
            build_id,
            is_dyn: false,
            elf_loads: vec![],
        }
    }
}

/// Returns the build id of an executable. GNU build ids take precedence,
/// then Go build ids, and for binaries carrying neither we hash the text
/// section. Always hex-encoded.
pub fn build_id(object: &object::File) -> Result<String> {
    if let Some(data) = object.build_id()? {
        return Ok(HEXLOWER.encode(data));
    }

    // Golang (the Go toolchain does not interpret these bytes as we do).
    for section in object.sections() {
        if section.name()? == ".note.go.buildid" {
            if let Ok(data) = section.data() {
                return Ok(HEXLOWER.encode(data));
            }
        }
    }

    // No build id (Rust, some compilers and Linux distributions).
    for section in object.sections() {
        if section.name()? == ".text" {
            if let Ok(data) = section.data() {
                return Ok(HEXLOWER.encode(sha256_digest(data).as_ref()));
            }
        }
    }

    Err(anyhow!("no build id and no .text section"))
}

/// Parses `path` just enough to compute its build id.
pub fn file_build_id(path: &Path) -> Result<String> {
    let file = fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file) }?;
    let object = object::File::parse(&*mmap)?;
    build_id(&object)
}

fn elf_load_segments(mmap: &[u8]) -> Result<Vec<ElfLoad>> {
    match FileKind::parse(mmap) {
        Ok(FileKind::Elf32) => {
            let header: &FileHeader32<Endianness> = FileHeader32::<Endianness>::parse(mmap)?;
            let endian = header.endian()?;
            let segments = header.program_headers(endian, mmap)?;

            let mut elf_loads = Vec::new();
            for segment in segments {
                if segment.p_type(endian) == PT_LOAD {
                    elf_loads.push(ElfLoad {
                        p_offset: segment.p_offset(endian) as u64,
                        p_vaddr: segment.p_vaddr(endian) as u64,
                        p_filesz: segment.p_filesz(endian) as u64,
                    });
                }
            }
            Ok(elf_loads)
        }
        Ok(FileKind::Elf64) => {
            let header: &FileHeader64<Endianness> = FileHeader64::<Endianness>::parse(mmap)?;
            let endian = header.endian()?;
            let segments = header.program_headers(endian, mmap)?;

            let mut elf_loads = Vec::new();
            for segment in segments {
                if segment.p_type(endian) == PT_LOAD {
                    elf_loads.push(ElfLoad {
                        p_offset: segment.p_offset(endian),
                        p_vaddr: segment.p_vaddr(endian),
                        p_filesz: segment.p_filesz(endian),
                    });
                }
            }
            Ok(elf_loads)
        }
        Ok(other_file_kind) => Err(anyhow!(
            "object is not a 32 or 64 bit ELF but {:?}",
            other_file_kind
        )),
        Err(e) => Err(anyhow!("FileKind failed with {:?}", e)),
    }
}

fn sha256_digest<R: Read>(mut reader: R) -> Digest {
    let mut context = Context::new(&SHA256);
    let mut buffer = [0; 1024];

    loop {
        let count = reader
            .read(&mut buffer)
            .expect("reading digest into buffer should not fail");
        if count == 0 {
            break;
        }
        context.update(&buffer[..count]);
    }

    context.finish()
}

/// Bounded cache of opened object files, keyed by process and mapping.
/// Parsing headers is not free and the same few executables back most of
/// the address space of a host, so a small capacity goes a long way.
/// Eviction closes the file; a failed open is not cached, the next lookup
/// retries.
pub struct ObjectFileCache {
    inner: Mutex<LruCache<(Pid, u64, String), Arc<ObjectFile>>>,
}

impl Default for ObjectFileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectFileCache {
    pub fn new() -> Self {
        ObjectFileCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(OBJECT_FILE_CACHE_SIZE).unwrap(),
            )),
        }
    }

    pub fn object_file_for(&self, pid: Pid, mapping: &Mapping) -> Result<Arc<ObjectFile>> {
        let key = (pid, mapping.start, mapping.file.clone());
        let mut inner = self.inner.lock();
        if let Some(object_file) = inner.get(&key) {
            return Ok(object_file.clone());
        }

        // Open through /proc/<pid>/root so files in other mount namespaces
        // resolve too.
        let abs_path = PathBuf::from(format!("/proc/{}/root{}", pid, mapping.file));
        let object_file = Arc::new(ObjectFile::open(&abs_path)?);
        inner.put(key, object_file.clone());
        Ok(object_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mapping(start: u64, limit: u64, offset: u64) -> Mapping {
        Mapping {
            start,
            limit,
            offset,
            file: "/usr/lib/libfake.so".to_string(),
            build_id: String::new(),
        }
    }

    #[test]
    fn fixed_address_executables_are_not_rebased() {
        let object_file = ObjectFile::with_segments(false, vec![]);
        let mapping = test_mapping(0x400000, 0x500000, 0);
        assert_eq!(object_file.obj_addr(0x401234, &mapping).unwrap(), 0x401234);
    }

    #[test]
    fn pie_addresses_go_through_load_segments() {
        let object_file = ObjectFile::with_segments(
            true,
            vec![ElfLoad {
                p_offset: 0x1,
                p_vaddr: 0x0,
                p_filesz: 0x20,
            }],
        );
        let mapping = test_mapping(0x100, 0x100 + 100, 0x0);

        assert_eq!(object_file.obj_addr(0x110, &mapping).unwrap(), 0xF);

        // An address below every load segment has no home in the binary.
        let object_file = ObjectFile::with_segments(
            true,
            vec![ElfLoad {
                p_offset: 0x0,
                p_vaddr: 0x0,
                p_filesz: 0x5,
            }],
        );
        assert!(matches!(
            object_file.obj_addr(0x110, &mapping),
            Err(NormalizationError::NoSegment { .. })
        ));
    }

    #[test]
    fn pie_without_segments_fails() {
        let object_file = ObjectFile::with_segments(true, vec![]);
        let mapping = test_mapping(0x100, 0x200, 0);
        assert!(object_file.obj_addr(0x110, &mapping).is_err());
    }

    #[test]
    fn own_executable_parses() {
        let exe = std::env::current_exe().unwrap();
        let object_file = ObjectFile::open(&exe).unwrap();
        assert!(!object_file.build_id.is_empty());
        assert!(!object_file.elf_loads.is_empty());
    }

    #[test]
    fn cache_hits_and_retries() {
        let cache = ObjectFileCache::new();
        let pid = std::process::id();
        let exe = std::env::current_exe().unwrap();

        let mapping = Mapping {
            start: 0x1000,
            limit: 0x2000,
            offset: 0,
            file: exe.to_string_lossy().to_string(),
            build_id: String::new(),
        };

        let first = cache.object_file_for(pid, &mapping).unwrap();
        let second = cache.object_file_for(pid, &mapping).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let missing = test_mapping(0, 0x1000, 0);
        assert!(cache.object_file_for(pid, &missing).is_err());
    }
}
