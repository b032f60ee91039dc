//! Guarded program composition.
//!
//! The child interpreter never runs the caller's script directly. It runs
//! a guarded program made of three parts:
//!
//! 1. **Guards**: the real stdout is set aside for the result and
//!    `sys.stdout` is pointed at stderr, so stray `print` calls cannot
//!    corrupt the output contract. `__import__` is replaced by an
//!    allow-list check for imports issued from the script namespace,
//!    and `open` (also as `io.open`) and the socket entry points (also on
//!    `_socket`) are wrapped according to the policy's filesystem and
//!    network flags.
//! 2. **Context**: the context JSON, embedded as a string literal, is
//!    decoded and bound as top-level names of the script namespace.
//! 3. **Script and capture**: the script, also embedded as a literal, is
//!    compiled as `<sandbox>` and executed in that namespace. A raised
//!    exception prints `{"success": false, "error", "error_type"}` to the
//!    real stdout and exits 1. Otherwise the value bound to `result`
//!    (or `{"success": true}` when the script never binds it) is printed as
//!    one JSON value. Objects with a `to_json()` method are converted
//!    first; anything else that JSON cannot encode becomes an
//!    `OutputContractError` failure.
//!
//! Every embedded payload is a JSON string literal, which is also a valid
//! Python string literal, so no caller-controlled text is ever spliced
//! into the program as code.

use serde_json::json;

use crate::context::Context;
use crate::error::{Result, SandboxError};
use crate::policy::IsolationPolicy;

/// Module name under which the SafeArray/SafeTable library is importable.
pub const SUPPORT_MODULE_NAME: &str = "safe_data";

/// Source of the support module written next to the guarded program.
pub const SUPPORT_MODULE_SOURCE: &str = include_str!("../../assets/safe_data.py");

/// File name of the guarded program inside the scoped temp dir.
pub const PROGRAM_FILE_NAME: &str = "program.py";

/// Interpreter helpers that C code imports lazily on the script's behalf
/// (`time.strptime` pulls in `_strptime`, codec lookup pulls in
/// `encodings`). Such imports carry the script's globals, so the guard
/// cannot tell them from the script's own.
pub const IMPLICIT_MODULES: &[&str] = &[
    "_strptime",
    "_datetime",
    "_pydatetime",
    "_decimal",
    "_pydecimal",
    "_json",
    "_random",
    "_statistics",
    "encodings",
];

/// Name of the binding captured as the run's output.
pub const RESULT_BINDING: &str = "result";

const GUARDS: &str = r#"import builtins as _sandbox_builtins
import json as _sandbox_json
import os as _sandbox_os
import sys as _sandbox_sys

_sandbox_stdout = _sandbox_sys.stdout
_sandbox_sys.stdout = _sandbox_sys.stderr

_sandbox_allowed = frozenset(_sandbox_policy["allowed_modules"]) | {_sandbox_policy["support_module"]}
_sandbox_implicit = frozenset(_sandbox_policy["implicit_modules"])
_sandbox_original_import = _sandbox_builtins.__import__


class ImportDenied(ImportError):
    pass


def _sandbox_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level == 0 and (globals is None or globals.get("__name__") == "__sandbox__"):
        root = name.partition(".")[0]
        if root not in _sandbox_allowed and root not in _sandbox_implicit:
            raise ImportDenied(
                "Import of module '%s' is not allowed. Allowed modules: %s"
                % (root, ", ".join(sorted(_sandbox_allowed)))
            )
    return _sandbox_original_import(name, globals, locals, fromlist, level)


_sandbox_builtins.__import__ = _sandbox_import

_sandbox_original_open = _sandbox_builtins.open
_sandbox_read_roots = [_sandbox_os.path.realpath(p) for p in _sandbox_policy["allowed_read_paths"]]


def _sandbox_under_root(path):
    for root in _sandbox_read_roots:
        if path == root or path.startswith(root.rstrip(_sandbox_os.sep) + _sandbox_os.sep):
            return True
    return False


def _sandbox_open(file, mode="r", *args, **kwargs):
    writing = any(flag in mode for flag in "wax+")
    if writing and not _sandbox_policy["filesystem_write"]:
        raise PermissionError("filesystem writes are not allowed in this sandbox")
    if not writing:
        if not _sandbox_policy["filesystem_read"]:
            raise PermissionError("filesystem reads are not allowed in this sandbox")
        if _sandbox_read_roots:
            if isinstance(file, int):
                raise PermissionError("reading raw file descriptors is not allowed in this sandbox")
            path = _sandbox_os.path.realpath(_sandbox_os.fsdecode(file))
            if not _sandbox_under_root(path):
                raise PermissionError("reading '%s' is not allowed in this sandbox" % path)
    return _sandbox_original_open(file, mode, *args, **kwargs)


_sandbox_builtins.open = _sandbox_open

# The import system loads source through io.open, so binary reads below the
# import roots stay allowed there.
_sandbox_import_roots = [
    _sandbox_os.path.realpath(p or ".") for p in _sandbox_sys.path if _sandbox_os.path.isdir(p or ".")
]


def _sandbox_io_open(file, mode="r", *args, **kwargs):
    if mode == "rb" and isinstance(file, str):
        path = _sandbox_os.path.realpath(file)
        for root in _sandbox_import_roots:
            if path.startswith(root.rstrip(_sandbox_os.sep) + _sandbox_os.sep):
                return _sandbox_original_open(file, mode, *args, **kwargs)
    return _sandbox_open(file, mode, *args, **kwargs)


for _sandbox_name in ("io", "_io"):
    _sandbox_original_import(_sandbox_name).open = _sandbox_io_open


def _sandbox_parse_endpoint(text):
    text = text.split("://", 1)[-1].split("/", 1)[0].strip().lower()
    host, sep, port = text.rpartition(":")
    if sep and port.isdigit():
        return host, int(port)
    return text, None


_sandbox_endpoints = (
    [_sandbox_parse_endpoint(e) for e in _sandbox_policy["allowed_endpoints"]]
    if _sandbox_policy["network_allowed"]
    else []
)
_sandbox_resolved = set()


def _sandbox_endpoint_allowed(host, port):
    host = str(host).lower().rstrip(".") if host is not None else ""
    try:
        port = int(port) if port is not None else None
    except (TypeError, ValueError):
        port = None
    for allowed_host, allowed_port in _sandbox_endpoints:
        if host == allowed_host and (allowed_port is None or port is None or allowed_port == port):
            return True
    return False


def _sandbox_address_allowed(address):
    if not isinstance(address, tuple) or len(address) < 2:
        return False
    if (str(address[0]).lower(), address[1]) in _sandbox_resolved:
        return True
    return _sandbox_endpoint_allowed(address[0], address[1])


def _sandbox_check_address(address):
    if not _sandbox_address_allowed(address):
        raise PermissionError("network access to %r is not allowed in this sandbox" % (address,))


def _sandbox_guard_socket_class(cls):
    original_connect = cls.connect
    original_connect_ex = cls.connect_ex
    original_sendto = cls.sendto

    def connect(sock, address):
        _sandbox_check_address(address)
        return original_connect(sock, address)

    def connect_ex(sock, address):
        _sandbox_check_address(address)
        return original_connect_ex(sock, address)

    def sendto(sock, data, *args):
        if args:
            _sandbox_check_address(args[-1])
        return original_sendto(sock, data, *args)

    return {"connect": connect, "connect_ex": connect_ex, "sendto": sendto}


try:
    import socket as _sandbox_socket
except ImportError:
    _sandbox_socket = None

if _sandbox_socket is not None:
    _sandbox_original_getaddrinfo = _sandbox_socket.getaddrinfo

    def _sandbox_getaddrinfo(host, port, *args, **kwargs):
        if not _sandbox_endpoint_allowed(host, port):
            raise PermissionError("network access to %s:%s is not allowed in this sandbox" % (host, port))
        infos = _sandbox_original_getaddrinfo(host, port, *args, **kwargs)
        for info in infos:
            _sandbox_resolved.add((str(info[4][0]).lower(), info[4][1]))
        return infos

    _sandbox_socket.getaddrinfo = _sandbox_getaddrinfo
    for _sandbox_name, _sandbox_method in _sandbox_guard_socket_class(_sandbox_socket.socket).items():
        setattr(_sandbox_socket.socket, _sandbox_name, _sandbox_method)

try:
    import _socket as _sandbox_csocket
except ImportError:
    _sandbox_csocket = None

if _sandbox_csocket is not None:
    _sandbox_csocket.socket = type(
        "socket",
        (_sandbox_csocket.socket,),
        dict(_sandbox_guard_socket_class(_sandbox_csocket.socket), __slots__=()),
    )
    _sandbox_csocket.SocketType = _sandbox_csocket.socket
"#;

const RUNNER: &str = r#"_sandbox_no_result = object()


def _sandbox_default(value):
    to_json = getattr(value, "to_json", None)
    if callable(to_json):
        return to_json()
    raise TypeError("Object of type %s is not JSON serializable" % type(value).__name__)


def _sandbox_emit(payload):
    _sandbox_stdout.write(payload)
    _sandbox_stdout.write("\n")
    _sandbox_stdout.flush()


def _sandbox_fail(error, error_type):
    _sandbox_emit(_sandbox_json.dumps({"success": False, "error": error, "error_type": error_type}))
    _sandbox_sys.exit(1)


try:
    exec(compile(_sandbox_source, "<sandbox>", "exec"), _sandbox_namespace)
except Exception as exc:
    _sandbox_fail("%s: %s" % (type(exc).__name__, exc), type(exc).__name__)

_sandbox_result = _sandbox_namespace.get("result", _sandbox_no_result)
if _sandbox_result is _sandbox_no_result:
    _sandbox_result = {"success": True}

try:
    _sandbox_payload = _sandbox_json.dumps(_sandbox_result, default=_sandbox_default, allow_nan=False)
except (TypeError, ValueError, RecursionError) as exc:
    _sandbox_fail("Script did not return JSON-serializable output: %s" % exc, "OutputContractError")
else:
    _sandbox_emit(_sandbox_payload)
"#;

/// A composed, self-contained program ready to be written and executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedProgram {
    source: String,
}

impl GuardedProgram {
    /// Compose the guarded program for `script` under `policy`.
    pub fn compose(policy: &IsolationPolicy, context: &Context, script: &str) -> Result<Self> {
        let policy_json = json!({
            "allowed_modules": policy.allowed_modules,
            "support_module": SUPPORT_MODULE_NAME,
            "implicit_modules": IMPLICIT_MODULES,
            "network_allowed": policy.network_allowed,
            "allowed_endpoints": policy.allowed_endpoints,
            "filesystem_read": policy.filesystem_read,
            "filesystem_write": policy.filesystem_write,
            "allowed_read_paths": policy
                .allowed_read_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
        });

        let mut source = String::with_capacity(GUARDS.len() + RUNNER.len() + script.len() + 512);
        source.push_str("# guarded program: guards\n");
        source.push_str("import json as _sandbox_json\n");
        source.push_str(&format!(
            "_sandbox_policy = _sandbox_json.loads({})\n",
            python_literal(&policy_json.to_string())?
        ));
        source.push_str(GUARDS);

        source.push_str("\n# guarded program: context\n");
        source.push_str(
            "_sandbox_namespace = {\"__name__\": \"__sandbox__\", \"__builtins__\": _sandbox_builtins}\n",
        );
        source.push_str(&format!(
            "_sandbox_namespace.update(_sandbox_json.loads({}))\n",
            python_literal(&context.to_json().to_string())?
        ));

        source.push_str("\n# guarded program: script\n");
        source.push_str(&format!("_sandbox_source = {}\n", python_literal(script)?));
        source.push_str(RUNNER);

        Ok(Self { source })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn into_source(self) -> String {
        self.source
    }
}

/// Encode text as a double-quoted literal valid in both JSON and Python.
fn python_literal(text: &str) -> Result<String> {
    serde_json::to_string(text).map_err(SandboxError::Json)
}

/// Category of a suspicious token found by [`validate_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FindingCategory {
    DynamicEval,
    OsInvocation,
    FileAccess,
    UnsafeDeserialization,
    Introspection,
}

/// One suspicious token occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFinding {
    pub token: &'static str,
    pub line: usize,
    pub category: FindingCategory,
}

/// Outcome of the pre-flight scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeReport {
    pub findings: Vec<CodeFinding>,
}

impl CodeReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Distinct tokens found, in first-seen order.
    pub fn tokens(&self) -> Vec<&'static str> {
        let mut tokens: Vec<&'static str> = Vec::new();
        for finding in &self.findings {
            if !tokens.contains(&finding.token) {
                tokens.push(finding.token);
            }
        }
        tokens
    }
}

const SUSPICIOUS_TOKENS: &[(&str, FindingCategory)] = &[
    ("eval(", FindingCategory::DynamicEval),
    ("exec(", FindingCategory::DynamicEval),
    ("compile(", FindingCategory::DynamicEval),
    ("__import__", FindingCategory::DynamicEval),
    ("os.system", FindingCategory::OsInvocation),
    ("os.popen", FindingCategory::OsInvocation),
    ("os.exec", FindingCategory::OsInvocation),
    ("os.spawn", FindingCategory::OsInvocation),
    ("os.fork", FindingCategory::OsInvocation),
    ("subprocess", FindingCategory::OsInvocation),
    ("pty.spawn", FindingCategory::OsInvocation),
    ("open(", FindingCategory::FileAccess),
    ("os.remove", FindingCategory::FileAccess),
    ("os.unlink", FindingCategory::FileAccess),
    ("shutil.rmtree", FindingCategory::FileAccess),
    ("pickle.load", FindingCategory::UnsafeDeserialization),
    ("marshal.load", FindingCategory::UnsafeDeserialization),
    ("shelve.open", FindingCategory::UnsafeDeserialization),
    ("yaml.load(", FindingCategory::UnsafeDeserialization),
    ("__builtins__", FindingCategory::Introspection),
    ("__subclasses__", FindingCategory::Introspection),
    ("__globals__", FindingCategory::Introspection),
    ("__code__", FindingCategory::Introspection),
];

/// Scan a script for dangerous-looking tokens.
///
/// This is an advisory heuristic: renaming or aliasing defeats it. It
/// only surfaces intent early; the limits on the child process are what
/// bound a script. Findings are reported in line order.
pub fn validate_code(script: &str) -> CodeReport {
    let mut findings = Vec::new();
    for (index, line) in script.lines().enumerate() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        for &(token, category) in SUSPICIOUS_TOKENS {
            if line.contains(token) {
                findings.push(CodeFinding {
                    token,
                    line: index + 1,
                    category,
                });
            }
        }
    }
    CodeReport { findings }
}
