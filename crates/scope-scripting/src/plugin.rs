//! Plugin identity, entry classification, and loading.

use crate::engine;
use mlua::{Lua, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

/// Event callbacks a plugin may export. Anything else starting with `on_`
/// is treated as a typo and warned about at load time.
pub const EVENT_CALLBACKS: &[&str] = &[
    "on_serial_send",
    "on_serial_recv",
    "on_serial_connect",
    "on_serial_disconnect",
    "on_rtt_send",
    "on_rtt_recv",
    "on_rtt_connect",
    "on_rtt_disconnect",
    "on_ble_connect",
    "on_ble_disconnect",
    "on_ble_read",
    "on_ble_write",
    "on_ble_write_nowait",
    "on_ble_notify",
    "on_ble_indicate",
    "on_mtu_change",
];

/// Lifecycle of a loaded plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Loading,
    Ready,
    Failed,
    Unloading,
    Dead,
}

/// A classified export of the plugin table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEntry {
    Lifecycle(String),
    EventCallback(String),
    UserCommand(String),
}

/// The fixed callback surface discovered at load time.
#[derive(Debug, Default, Clone)]
pub struct PluginEntries {
    pub has_on_load: bool,
    pub has_on_unload: bool,
    /// Known `on_*` event callbacks present in the table.
    pub callbacks: BTreeSet<String>,
    /// Exported user commands (any other function-valued key).
    pub commands: BTreeSet<String>,
    /// `on_`-prefixed names outside the known set; warned, never invoked.
    pub unknown_callbacks: Vec<String>,
}

impl PluginEntries {
    pub fn classify(names: impl IntoIterator<Item = String>) -> Self {
        let mut entries = Self::default();
        for name in names {
            match name.as_str() {
                "on_load" => entries.has_on_load = true,
                "on_unload" => entries.has_on_unload = true,
                _ if EVENT_CALLBACKS.contains(&name.as_str()) => {
                    entries.callbacks.insert(name);
                }
                _ if name.starts_with("on_") => entries.unknown_callbacks.push(name),
                _ => {
                    entries.commands.insert(name);
                }
            }
        }
        entries
    }

    pub fn entry(&self, name: &str) -> Option<PluginEntry> {
        if (name == "on_load" && self.has_on_load) || (name == "on_unload" && self.has_on_unload) {
            return Some(PluginEntry::Lifecycle(name.to_string()));
        }
        if self.callbacks.contains(name) {
            return Some(PluginEntry::EventCallback(name.to_string()));
        }
        if self.commands.contains(name) {
            return Some(PluginEntry::UserCommand(name.to_string()));
        }
        None
    }
}

/// A loaded plugin: identity, interpreter, and discovered surface.
///
/// Lives on the script thread only; the `Lua` state is `!Send`.
#[derive(Debug)]
pub struct Plugin {
    name: Arc<String>,
    path: PathBuf,
    lua: Rc<Lua>,
    entries: PluginEntries,
}

impl Plugin {
    /// Read and evaluate a plugin script.
    ///
    /// A missing extension is filled in with `.lua`; any other extension is
    /// rejected. The returned error strings are user-facing (load-error).
    pub fn load(path: &Path) -> Result<Self, String> {
        let path = normalize_path(path)?;
        let name = Arc::new(plugin_name(&path)?);

        let code = std::fs::read_to_string(&path)
            .map_err(|err| format!("cannot read \"{}\": {err}", path.display()))?;

        let plugin_dir = path.parent().unwrap_or(Path::new("/"));
        let lua = engine::new_plugin_lua(plugin_dir).map_err(|err| err.to_string())?;
        engine::eval_plugin_table(&lua, &code, name.as_str())
            .map_err(|err| engine::clean_script_error(&err.to_string()))?;

        let entries = {
            let table = engine::plugin_table(&lua).map_err(|err| err.to_string())?;
            let mut names = Vec::new();
            for pair in table.pairs::<Value, Value>() {
                let (key, value) = pair.map_err(|err| err.to_string())?;
                if let (Value::String(key), Value::Function(_)) = (&key, &value)
                    && let Ok(key) = key.to_str()
                {
                    names.push(key.to_string());
                }
            }
            PluginEntries::classify(names)
        };

        Ok(Self {
            name,
            path,
            lua: Rc::new(lua),
            entries,
        })
    }

    pub fn name(&self) -> &Arc<String> {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lua(&self) -> &Rc<Lua> {
        &self.lua
    }

    pub fn entries(&self) -> &PluginEntries {
        &self.entries
    }
}

/// Absolute path with the `.lua` extension enforced.
pub fn normalize_path(path: &Path) -> Result<PathBuf, String> {
    let path = match path.extension() {
        None => path.with_extension("lua"),
        Some(ext) if ext.eq_ignore_ascii_case("lua") => path.to_path_buf(),
        Some(ext) => {
            return Err(format!("invalid plugin extension: {:?}", ext));
        }
    };

    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map_err(|err| format!("cannot resolve working directory: {err}"))?
            .join(path)
    };

    Ok(std::fs::canonicalize(&absolute).unwrap_or(absolute))
}

/// Display name: basename without extension.
pub fn plugin_name(path: &Path) -> Result<String, String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.to_string())
        .ok_or_else(|| format!("cannot derive a plugin name from \"{}\"", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn classification_buckets_names() {
        let entries = PluginEntries::classify(
            [
                "on_load",
                "on_serial_recv",
                "on_serial_rcv", // typo
                "greet",
                "build",
            ]
            .into_iter()
            .map(String::from),
        );

        assert!(entries.has_on_load);
        assert!(!entries.has_on_unload);
        assert!(entries.callbacks.contains("on_serial_recv"));
        assert_eq!(entries.unknown_callbacks, vec!["on_serial_rcv".to_string()]);
        assert_eq!(
            entries.commands.iter().cloned().collect::<Vec<_>>(),
            vec!["build".to_string(), "greet".to_string()]
        );
        assert_eq!(
            entries.entry("greet"),
            Some(PluginEntry::UserCommand("greet".to_string()))
        );
        assert_eq!(entries.entry("on_unload"), None);
    }

    #[test]
    fn load_discovers_the_exported_surface() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.lua");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
            local M = {{}}
            function M.on_load() return true end
            function M.on_serial_recv(msg) end
            function M.status() end
            M.version = "1.0"
            return M
            "#
        )
        .unwrap();

        let plugin = Plugin::load(&path).unwrap();
        assert_eq!(plugin.name().as_str(), "probe");
        assert!(plugin.entries().has_on_load);
        assert!(plugin.entries().callbacks.contains("on_serial_recv"));
        assert!(plugin.entries().commands.contains("status"));
        // Non-function exports are not entries.
        assert!(!plugin.entries().commands.contains("version"));
    }

    #[test]
    fn load_reports_script_errors_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.lua");
        std::fs::write(&path, "return nonsense(").unwrap();

        let err = Plugin::load(&path).unwrap_err();
        assert!(!err.contains("[string"), "engine noise leaked: {err}");
    }

    #[test]
    fn normalize_fills_missing_extension_and_rejects_others() {
        let normalized = normalize_path(Path::new("/tmp/echo")).unwrap();
        assert!(normalized.to_string_lossy().ends_with("echo.lua"));
        assert!(normalize_path(Path::new("/tmp/echo.py")).is_err());
    }
}
