use std::env;
use std::path::PathBuf;

/// Overrides the configuration directory outright.
pub const CONFIG_DIR_ENV: &str = "COURIER_CONFIG_DIR";

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Option<PathBuf> {
    ["HOME", "USERPROFILE"]
        .into_iter()
        .filter_map(|key| env::var_os(key))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Directory holding `settings.json` and the default transcript/journal dirs.
///
/// `COURIER_CONFIG_DIR`, else `$XDG_CONFIG_HOME/courier`, else
/// `<home>/.config/courier`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = non_empty_var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }
    if let Some(xdg) = non_empty_var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("courier"));
    }
    get_home_dir().map(|home| home.join(".config").join("courier"))
}

fn non_empty_var(key: &str) -> Option<std::ffi::OsString> {
    env::var_os(key).filter(|value| !value.is_empty())
}
