//! App name to package name resolution for `launch` actions.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Lowercased display names to Android package names.
pub static APP_PACKAGES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();

    // System
    m.insert("settings", "com.android.settings");
    m.insert("camera", "com.android.camera");
    m.insert("phone", "com.google.android.dialer");
    m.insert("dialer", "com.google.android.dialer");
    m.insert("contacts", "com.google.android.contacts");
    m.insert("messages", "com.google.android.apps.messaging");
    m.insert("clock", "com.google.android.deskclock");
    m.insert("calculator", "com.google.android.calculator");
    m.insert("calendar", "com.google.android.calendar");
    m.insert("files", "com.google.android.apps.nbu.files");
    m.insert("photos", "com.google.android.apps.photos");
    m.insert("play store", "com.android.vending");

    // Google
    m.insert("chrome", "com.android.chrome");
    m.insert("gmail", "com.google.android.gm");
    m.insert("maps", "com.google.android.apps.maps");
    m.insert("google maps", "com.google.android.apps.maps");
    m.insert("youtube", "com.google.android.youtube");
    m.insert("drive", "com.google.android.apps.docs");

    // Social & messaging
    m.insert("whatsapp", "com.whatsapp");
    m.insert("telegram", "org.telegram.messenger");
    m.insert("signal", "org.thoughtcrime.securesms");
    m.insert("instagram", "com.instagram.android");
    m.insert("facebook", "com.facebook.katana");
    m.insert("messenger", "com.facebook.orca");
    m.insert("x", "com.twitter.android");
    m.insert("twitter", "com.twitter.android");
    m.insert("reddit", "com.reddit.frontpage");
    m.insert("linkedin", "com.linkedin.android");
    m.insert("slack", "com.Slack");
    m.insert("discord", "com.discord");
    m.insert("微信", "com.tencent.mm");
    m.insert("qq", "com.tencent.mobileqq");

    // Media & shopping
    m.insert("spotify", "com.spotify.music");
    m.insert("netflix", "com.netflix.mediaclient");
    m.insert("amazon", "com.amazon.mShop.android.shopping");
    m.insert("uber", "com.ubercab");
    m.insert("淘宝", "com.taobao.taobao");

    m
});

/// Resolve an app name to a package name.
///
/// Known display names are matched case-insensitively. Anything that already
/// looks like a package name, or is unknown, is passed through trimmed.
pub fn resolve_package(app: &str) -> String {
    let trimmed = app.trim();
    APP_PACKAGES
        .get(trimmed.to_lowercase().as_str())
        .map(|p| p.to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Check if an app name is in the known table.
pub fn is_known_app(app: &str) -> bool {
    APP_PACKAGES.contains_key(app.trim().to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_app_case_insensitive() {
        assert_eq!(resolve_package("WhatsApp"), "com.whatsapp");
        assert_eq!(resolve_package("  settings "), "com.android.settings");
        assert_eq!(resolve_package("微信"), "com.tencent.mm");
        assert!(is_known_app("Chrome"));
    }

    #[test]
    fn test_resolve_passes_package_through() {
        assert_eq!(resolve_package("com.example.app"), "com.example.app");
        assert!(!is_known_app("com.example.app"));
    }
}
