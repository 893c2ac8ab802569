//! Fixed questions the core asks the perception agent.
//!
//! Kept short on purpose; wording tuning belongs to the agent integration.

pub const RESPONSIVE: &str = "Is the page responsive and finished loading?";
pub const PAGE_STABLE: &str = "The page has finished loading and is stable";
pub const BLANK_PAGE: &str = "Is the main content area of the page blank?";
pub const ERROR_PAGE: &str = "Does the page show an error message or error page?";
pub const OVERLAY_PRESENT: &str = "Is a popup, dialog or overlay covering the page?";
pub const DISMISS_OVERLAY: &str = "the close button of the popup or overlay";
pub const SCROLL_DOWN: &str = "scroll the page down";

/// Question asked while scroll-searching for an element
pub fn element_visible(description: &str) -> String {
    format!("Is '{}' visible on the page?", description)
}

/// Tap description used to open an overflow/"more" menu
pub fn expand_menu(label: &str) -> String {
    format!("the '{}' menu expander", label)
}

/// Tap description for a navigation menu entry
pub fn menu_entry(text: &str) -> String {
    format!("the '{}' menu item", text)
}
