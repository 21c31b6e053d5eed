//! Lua engine glue.
//!
//! Each plugin gets its own `mlua::Lua` state: isolation is per interpreter,
//! so a crashed or misbehaving plugin cannot corrupt its neighbours. The
//! embedded stdlib stubs are seeded into `package.preload` so scripts reach
//! the host with plain `require("scope")` / `require("shell")`.

use mlua::{Lua, LuaOptions, StdLib, Table};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// `require("scope")` — log/fmt/serial/rtt/sys/re shims.
pub const SCOPE_STDLIB: &str = include_str!("lua/scope.lua");

/// `require("shell")` — the `Shell` session type.
pub const SHELL_STDLIB: &str = include_str!("lua/shell.lua");

/// Registry slot holding the plugin's exported table.
pub const PLUGIN_TABLE_KEY: &str = "scope.plugin_table";

/// Build the interpreter a plugin runs in.
///
/// `plugin_dir` is appended to `package.path` so a plugin can require
/// helper modules living next to it.
pub fn new_plugin_lua(plugin_dir: &Path) -> mlua::Result<Lua> {
    let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())?;

    {
        let package: Table = lua.globals().get("package")?;
        let dir = plugin_dir.to_string_lossy();
        let path: String = package.get("path")?;
        package.set("path", format!("{path};{dir}/?.lua"))?;

        let preload: Table = package.get("preload")?;
        preload.set(
            "scope",
            lua.load(SCOPE_STDLIB).set_name("scope.lua").into_function()?,
        )?;
        preload.set(
            "shell",
            lua.load(SHELL_STDLIB).set_name("shell.lua").into_function()?,
        )?;
    }

    Ok(lua)
}

/// Evaluate a plugin script and pin its exported table in the registry.
pub fn eval_plugin_table(lua: &Lua, code: &str, chunk_name: &str) -> mlua::Result<()> {
    let table: Table = lua.load(code).set_name(chunk_name).eval()?;
    lua.set_named_registry_value(PLUGIN_TABLE_KEY, table)
}

/// The pinned plugin table.
pub fn plugin_table(lua: &Lua) -> mlua::Result<Table> {
    lua.named_registry_value(PLUGIN_TABLE_KEY)
}

/// Strip the interpreter's `[string "chunk"]:` noise from an error message,
/// leaving `LINE: text` for the user log.
pub fn clean_script_error(message: &str) -> String {
    static CHUNK_PREFIX: OnceLock<Regex> = OnceLock::new();
    let re = CHUNK_PREFIX
        .get_or_init(|| Regex::new(r#"(?s).*\[string "[^"]*"\]:"#).expect("static regex"));
    re.replace(message, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{Function, MultiValue, Value};
    use proptest::prelude::*;

    fn lua_with_stdlib() -> Lua {
        new_plugin_lua(Path::new("/tmp")).unwrap()
    }

    #[test]
    fn require_scope_and_shell_resolve() {
        let lua = lua_with_stdlib();
        lua.load(
            r#"
            local scope = require("scope")
            assert(type(scope.log.info) == "function")
            assert(type(scope.fmt.to_str) == "function")
            assert(type(scope.re.matches) == "function")
            local Shell = require("shell")
            assert(type(Shell.new) == "function")
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn plugin_table_round_trips_through_registry() {
        let lua = lua_with_stdlib();
        eval_plugin_table(&lua, "return { greet = function() end }", "demo.lua").unwrap();
        let table = plugin_table(&lua).unwrap();
        assert!(table.get::<_, Function>("greet").is_ok());
    }

    #[test]
    fn eval_rejects_non_table_scripts() {
        let lua = lua_with_stdlib();
        assert!(eval_plugin_table(&lua, "return 42", "bad.lua").is_err());
    }

    #[test]
    fn clean_script_error_leaves_line_and_text() {
        let raw = "runtime error: [string \"echo.lua\"]:3: attempt to call a nil value";
        assert_eq!(
            clean_script_error(raw),
            "3: attempt to call a nil value"
        );
        // Messages without the chunk prefix pass through unchanged.
        assert_eq!(clean_script_error("plain failure"), "plain failure");
    }

    #[test]
    fn to_str_decodes_bytes_and_passes_strings() {
        let lua = lua_with_stdlib();
        lua.load(
            r#"
            local fmt = require("scope").fmt
            assert(fmt.to_str({72, 105}) == "Hi")
            assert(fmt.to_str("already text") == "already text")
            assert(fmt.to_str(nil) == "nil")
            assert(fmt.to_str({-1}) == string.char(255))
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn os_name_follows_the_os_variable() {
        let lua = lua_with_stdlib();
        let expected = if std::env::var("OS").as_deref() == Ok("Windows_NT") {
            "windows"
        } else {
            "unix"
        };
        let got: String = lua
            .load("return require(\"scope\").sys.os_name()")
            .eval()
            .unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn parse_args_coerces_defaults_and_validates() {
        let lua = lua_with_stdlib();
        lua.load(
            r#"
            local sys = require("scope").sys
            local count, verbose, name = sys.parse_args({
                { arg = "3", ty = "number", validate = function(n) return n > 0 end },
                { arg = "true", ty = "boolean" },
                { arg = nil, default = "world" },
            })
            assert(count == 3)
            assert(verbose == true)
            assert(name == "world")
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn parse_args_reports_ordinal_failures() {
        let lua = lua_with_stdlib();
        let err = lua
            .load(
                r#"
                local sys = require("scope").sys
                sys.parse_args({ { arg = "ok" }, { arg = "" } })
                "#,
            )
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("2nd argument must not be empty"));

        let err = lua
            .load(
                r#"
                local sys = require("scope").sys
                sys.parse_args({ { arg = "x", ty = "number" } })
                "#,
            )
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("1st argument is invalid"));
    }

    #[test]
    fn impure_stubs_yield_tagged_tuples() {
        let lua = lua_with_stdlib();
        let thread = lua
            .load(
                r#"
                return coroutine.create(function()
                    require("scope").serial.send("AT\r")
                end)
                "#,
            )
            .eval::<mlua::Thread>()
            .unwrap();

        let yielded: MultiValue = thread.resume(()).unwrap();
        let values = yielded.into_vec();
        assert!(matches!(&values[0], Value::String(s) if s.to_str().unwrap() == ":serial.send"));
    }

    proptest! {
        /// fmt.to_bytes(fmt.to_str(b)) == b for all byte arrays.
        #[test]
        fn byte_round_trip_law(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let lua = lua_with_stdlib();
            let func: Function = lua
                .load(
                    r#"
                    local fmt = require("scope").fmt
                    return function(b)
                        return fmt.to_bytes(fmt.to_str(b))
                    end
                    "#,
                )
                .eval()
                .unwrap();
            let round: Vec<u8> = func.call(bytes.clone()).unwrap();
            prop_assert_eq!(round, bytes);
        }
    }
}
