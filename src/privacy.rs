//! Sensitive-context classification.
//!
//! A foreground window is sensitive when its process name or title matches
//! the privacy lists. While a sensitive window has focus the observer keeps
//! running but the buffer is shadowed: no trigger fires, and the buffer is
//! reset when focus moves away.

/// Process/app names where keystrokes must never produce triggers.
const PRIVATE_APPS: &[&str] = &[
    // Payment apps
    "google pay",
    "gpay",
    "phonepe",
    "paytm",
    "paypal",
    // Banking
    "bank",
    "banking",
    "netbanking",
    // Password managers
    "lastpass",
    "1password",
    "bitwarden",
    "keepass",
    "dashlane",
    // Generic sensitive surfaces
    "password",
    "credential",
    "vault",
    "authenticator",
];

/// Window-title keywords that indicate sensitive content regardless of app.
const PRIVATE_TITLE_KEYWORDS: &[&str] = &[
    "password",
    "sign in",
    "login",
    "credential",
    "payment",
    "banking",
    "bank account",
    "credit card",
    "debit card",
    "cvv",
    "otp",
    "verification code",
    "incognito",
    "private browsing",
];

/// Classify a foreground window. Both inputs are matched case-insensitively
/// as substrings, the same way the privacy list is written.
pub fn is_sensitive(window_title: &str, process_name: &str) -> bool {
    let title = window_title.to_lowercase();
    let process = process_name.to_lowercase();

    if PRIVATE_APPS.iter().any(|app| process.contains(app)) {
        return true;
    }
    if PRIVATE_APPS.iter().any(|app| title.contains(app)) {
        return true;
    }
    PRIVATE_TITLE_KEYWORDS.iter().any(|kw| title.contains(kw))
}
