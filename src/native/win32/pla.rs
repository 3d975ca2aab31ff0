//! Native API - Performance Logs and Alerts COM
//!
//! Resolves provider names the way `logman query providers` does.
use windows::{
    core::VARIANT,
    Win32::System::{
        Com::{CoCreateInstance, CoInitializeEx, CLSCTX_ALL, COINIT_MULTITHREADED},
        Performance::{ITraceDataProviderCollection, TraceDataProviderCollection},
    },
};

use crate::native::guid::Guid;
use crate::native::{NativeError, NativeResult};

fn com_error(err: windows::core::Error) -> NativeError {
    NativeError::IoError(std::io::Error::from_raw_os_error(err.code().0))
}

// https://github.com/microsoft/krabsetw/blob/31679cf84bc85360158672699f2f68a821e8a6d0/krabs/krabs/provider.hpp#L487
pub(crate) fn provider_guid(name: &str) -> NativeResult<Guid> {
    // Not paired with CoUninitialize: the apartment stays initialized for the thread
    unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }
        .ok()
        .map_err(com_error)?;

    let all_providers: ITraceDataProviderCollection =
        unsafe { CoCreateInstance(&TraceDataProviderCollection, None, CLSCTX_ALL) }
            .map_err(com_error)?;

    unsafe {
        all_providers
            .GetTraceDataProviders(None)
            .map_err(com_error)?;
        let count = all_providers.Count().map_err(com_error)? as u32;

        for index in 0..count {
            let provider = all_providers
                .get_Item(&VARIANT::from(index))
                .map_err(com_error)?;
            let raw_name = provider.DisplayName().map_err(com_error)?;
            let provider_name = String::from_utf16_lossy(raw_name.as_wide());
            if provider_name.eq_ignore_ascii_case(name) {
                return provider.Guid().map(Guid::from).map_err(com_error);
            }
        }
    }

    Err(NativeError::ProviderNotFound(name.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_provider() {
        let guid = provider_guid("Microsoft-Windows-Kernel-Process").unwrap();
        assert_eq!(
            guid,
            Guid::from_u128(0x22fb2cd6_0e7b_422b_a0c7_2fad1fd0e716)
        );
    }

    #[test]
    fn test_provider_not_found() {
        assert!(matches!(
            provider_guid("Not-A-Real-Provider"),
            Err(NativeError::ProviderNotFound(_))
        ));
    }
}
