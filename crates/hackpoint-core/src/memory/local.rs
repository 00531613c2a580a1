//! The address space of the current (32-bit Windows) process.

use std::ffi::{CString, c_void};

use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY, VirtualAlloc, VirtualProtect, VirtualQuery,
};
use windows::Win32::System::Threading::GetCurrentProcess;
use windows::core::{HSTRING, PCSTR, PCWSTR};

use crate::breakpoint::native_dispatcher;
use crate::error::{Error, Result};

use super::reader::{ProcessMemory, ReadMemory, read_failed};
use super::region::{MemoryRegion, Protection};

/// Direct access to the memory of the process the engine runs in
#[derive(Debug, Clone, Copy)]
pub struct LocalProcess {
    module_base: u32,
}

impl LocalProcess {
    pub fn new() -> Result<Self> {
        // SAFETY: a null module name returns the handle of the main executable.
        let module = unsafe { GetModuleHandleW(PCWSTR::null()) }.map_err(|e| {
            Error::InvalidConfig(format!("Failed to get main module handle: {e}"))
        })?;
        Ok(Self {
            module_base: module.0 as usize as u32,
        })
    }
}

fn to_flags(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    match protection {
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::Read => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::Execute => PAGE_EXECUTE,
        Protection::ExecuteRead => PAGE_EXECUTE_READ,
        Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
    }
}

fn from_flags(flags: PAGE_PROTECTION_FLAGS) -> Protection {
    // Strip PAGE_GUARD / PAGE_NOCACHE modifiers
    let base = PAGE_PROTECTION_FLAGS(flags.0 & 0xFF);
    match base {
        PAGE_READONLY => Protection::Read,
        PAGE_READWRITE | PAGE_WRITECOPY => Protection::ReadWrite,
        PAGE_EXECUTE => Protection::Execute,
        PAGE_EXECUTE_READ => Protection::ExecuteRead,
        PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Protection::ExecuteReadWrite,
        _ => Protection::NoAccess,
    }
}

impl ReadMemory for LocalProcess {
    fn read_bytes(&self, address: u32, size: usize) -> Result<Vec<u8>> {
        if !self.check_region(address, size) {
            return Err(read_failed(address, "region not readable"));
        }
        let mut buffer = vec![0u8; size];
        // SAFETY: check_region verified that the whole range is committed and accessible.
        unsafe {
            std::ptr::copy_nonoverlapping(address as usize as *const u8, buffer.as_mut_ptr(), size);
        }
        Ok(buffer)
    }

    fn module_base(&self) -> u32 {
        self.module_base
    }

    fn resolve_export(&self, module: &str, function: &str) -> Option<u32> {
        let module_name = HSTRING::from(module);
        let function_name = CString::new(function).ok()?;
        // SAFETY: both names are valid NUL-terminated strings for the duration of the calls.
        unsafe {
            let handle = GetModuleHandleW(&module_name).ok()?;
            let proc = GetProcAddress(handle, PCSTR(function_name.as_ptr().cast()))?;
            Some(proc as usize as u32)
        }
    }
}

impl ProcessMemory for LocalProcess {
    fn query(&self, address: u32) -> Result<MemoryRegion> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        // SAFETY: VirtualQuery only writes into the provided structure.
        let written = unsafe {
            VirtualQuery(
                Some(address as usize as *const c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return Err(read_failed(address, "VirtualQuery failed"));
        }
        let protection = if info.State == MEM_COMMIT {
            from_flags(info.Protect)
        } else {
            Protection::NoAccess
        };
        Ok(MemoryRegion {
            base: info.BaseAddress as usize as u32,
            size: info.RegionSize,
            protection,
        })
    }

    fn protect(&self, address: u32, size: usize, protection: Protection) -> Result<Protection> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: the range was obtained from VirtualQuery or VirtualAlloc by the caller.
        unsafe {
            VirtualProtect(
                address as usize as *const c_void,
                size,
                to_flags(protection),
                &mut old,
            )
        }
        .map_err(|e| Error::ProtectFailed {
            address,
            message: e.to_string(),
        })?;
        Ok(from_flags(old))
    }

    fn write_bytes(&self, address: u32, bytes: &[u8]) -> Result<()> {
        let region = self.query(address)?;
        if !region.protection.is_writable() || !region.covers(address, bytes.len()) {
            return Err(Error::MemoryWriteFailed {
                address,
                message: "region not writable".to_string(),
            });
        }
        // SAFETY: the destination range is committed and writable.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as usize as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u32> {
        // SAFETY: a fresh reservation at a system-chosen address.
        let ptr = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, to_flags(protection)) };
        if ptr.is_null() {
            return Err(Error::AllocationFailed {
                size,
                message: windows::core::Error::from_win32().to_string(),
            });
        }
        Ok(ptr as usize as u32)
    }

    fn flush_instructions(&self, address: u32, size: usize) -> Result<()> {
        // SAFETY: flushing the instruction cache of our own process has no memory effects.
        unsafe {
            FlushInstructionCache(
                GetCurrentProcess(),
                Some(address as usize as *const c_void),
                size,
            )
        }
        .map_err(|e| Error::MemoryWriteFailed {
            address,
            message: e.to_string(),
        })
    }

    fn dispatcher_address(&self) -> u32 {
        native_dispatcher()
    }
}
