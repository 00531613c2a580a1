//! Asking the user what to do about a missing breakpoint handler.

use strum::{Display, EnumString};

/// How a missing breakpoint handler is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SymbolPolicy {
    /// Log it and skip the breakpoint
    #[default]
    Warn,
    /// Ask the [`Prompter`], which may abort the whole run
    Prompt,
}

pub trait Prompter: Send + Sync {
    /// Ask whether to go on without the handler `name`. `false` aborts.
    fn continue_without(&self, name: &str) -> bool;
}

/// Message box shown in the patched process
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageBoxPrompter;

#[cfg(windows)]
impl Prompter for MessageBoxPrompter {
    fn continue_without(&self, name: &str) -> bool {
        use windows::Win32::Foundation::HWND;
        use windows::Win32::UI::WindowsAndMessaging::{
            IDCANCEL, MB_ICONWARNING, MB_OKCANCEL, MessageBoxW,
        };
        use windows::core::HSTRING;

        let text = HSTRING::from(format!(
            "Breakpoint function '{name}' not found.\n\n\
             Press OK to continue without it, or Cancel to abort."
        ));
        let caption = HSTRING::from("hackpoint");
        // SAFETY: both strings outlive the call; a null owner window is allowed.
        let result =
            unsafe { MessageBoxW(HWND::default(), &text, &caption, MB_OKCANCEL | MB_ICONWARNING) };
        result != IDCANCEL
    }
}
