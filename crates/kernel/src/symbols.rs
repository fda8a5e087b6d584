//! Kernel function names, from the `kernel_symbols` boot module the symbolicator writes.

use core::ffi::CStr;

use limine::request::ModuleRequest;
use spin::Once;
use symbolicator::{Symbol, SymbolTable};

use kmm::VirtualAddress;

const MODULE_NAME: &CStr = c"kernel_symbols";

#[used]
#[unsafe(link_section = ".requests")]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

static TABLE: Once<SymbolTable<'static>> = Once::new();

/// Finds and validates the symbol table module. Without one, tracebacks fall back to
/// section offsets.
pub fn init() {
    let Some(response) = MODULE_REQUEST.get_response() else {
        log::info!("symbols: no boot modules");
        return;
    };
    let Some(module) = response
        .modules()
        .iter()
        .find(|module| module.string() == MODULE_NAME)
    else {
        log::info!("symbols: no {:?} module, tracebacks will be unnamed", MODULE_NAME);
        return;
    };

    // SAFETY: Limine maps modules in the direct map as EXECUTABLE_AND_MODULES memory, which the
    // PMM never hands out and the kernel keeps mapped.
    let data = unsafe { core::slice::from_raw_parts(module.addr(), module.size() as usize) };
    match SymbolTable::from_bytes(data) {
        Ok(table) => {
            log::info!("symbols: {} functions", table.len());
            TABLE.call_once(|| table);
        }
        Err(error) => log::warn!("symbols: ignoring {:?}: {}", MODULE_NAME, error),
    }
}

/// The function containing `address`, once [`init`] found a table.
pub fn resolve(address: VirtualAddress) -> Option<Symbol<'static>> {
    TABLE.get()?.lookup(address.as_usize() as u64)
}
