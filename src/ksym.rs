use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use anyhow::Result;
use parking_lot::Mutex;

pub const KALLSYM_PATH: &str = "/proc/kallsyms";

/// Name given to kernel addresses that fall outside every known symbol.
pub const SYMBOL_NOT_FOUND: &str = "not found";

#[derive(Debug, PartialEq, Clone)]
pub struct Ksym {
    pub start_addr: u64,
    pub symbol_name: String,
}

/// Reads a kallsyms-formatted symbol table: one `address type name` line
/// per symbol, addresses in hex. Only symbol types that can show up in a
/// stack trace are kept (`man nm` describes the type letters); everything
/// else, including malformed lines, is skipped.
fn parse_ksyms<R: Read>(reader: R) -> Vec<Ksym> {
    let mut symbols = Vec::new();

    for line in BufReader::new(reader).lines() {
        let Ok(line) = line else {
            break;
        };
        let mut fields = line.split_whitespace();
        let (Some(addr), Some(symbol_type), Some(name)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !matches!(symbol_type, "T" | "t" | "W" | "D") {
            continue;
        }
        let Ok(start_addr) = u64::from_str_radix(addr, 16) else {
            continue;
        };
        symbols.push(Ksym {
            start_addr,
            symbol_name: name.to_string(),
        });
    }

    symbols
}

struct KsymCacheInner {
    /// Sorted by start address, loaded on first use.
    symbols: Option<Vec<Ksym>>,
    resolved: HashMap<u64, String>,
}

/// Resolves kernel text addresses to function names against a snapshot of
/// the kernel's exported symbol table. Results are cached across rounds;
/// concurrent resolves are serialized.
pub struct KsymCache {
    inner: Mutex<KsymCacheInner>,
}

impl Default for KsymCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KsymCache {
    pub fn new() -> Self {
        KsymCache {
            inner: Mutex::new(KsymCacheInner {
                symbols: None,
                resolved: HashMap::new(),
            }),
        }
    }

    /// A cache over a fixed symbol table, rather than the running kernel's.
    pub fn with_symbols(mut symbols: Vec<Ksym>) -> Self {
        symbols.sort_by_key(|ksym| ksym.start_addr);
        KsymCache {
            inner: Mutex::new(KsymCacheInner {
                symbols: Some(symbols),
                resolved: HashMap::new(),
            }),
        }
    }

    /// Resolves every queried address in one call. An address maps to the
    /// symbol with the greatest start address not above it, or to
    /// `SYMBOL_NOT_FOUND` when it is below the first symbol.
    pub fn resolve(&self, addresses: &HashSet<u64>) -> Result<HashMap<u64, String>> {
        let mut inner = self.inner.lock();

        if inner.symbols.is_none() {
            let mut symbols = parse_ksyms(File::open(KALLSYM_PATH)?);
            symbols.sort_by_key(|ksym| ksym.start_addr);
            inner.symbols = Some(symbols);
        }

        let mut result = HashMap::with_capacity(addresses.len());
        for &addr in addresses {
            if let Some(name) = inner.resolved.get(&addr) {
                result.insert(addr, name.clone());
                continue;
            }

            let symbols = inner.symbols.as_ref().unwrap();
            let name = match symbols.binary_search_by(|el| el.start_addr.cmp(&addr)) {
                Ok(idx) => symbols[idx].symbol_name.clone(),
                Err(0) => SYMBOL_NOT_FOUND.to_string(),
                Err(idx) => symbols[idx - 1].symbol_name.clone(),
            };
            inner.resolved.insert(addr, name.clone());
            result.insert(addr, name);
        }

        Ok(result)
    }
}
