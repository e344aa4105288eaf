//! Compartment self-test.
//!
//! Before the entry export runs, the sandbox reports every function the host
//! exposes to it and every function the guest imports. The surface passes only
//! if the single mediated capability gate is all that is reachable.

use std::collections::BTreeSet;

use super::channel::SurfaceReport;

/// The one host function a strict compartment may expose.
pub const CAP_INVOKE_EXPORT: &str = "weft::cap_invoke";

/// Host exports a compliant compartment reports.
pub const MEDIATED_SURFACE: &[&str] = &[CAP_INVOKE_EXPORT];

/// A class of ambient authority that must not be reachable.
#[derive(Debug, Clone, Copy)]
pub struct ForbiddenClass {
    pub code: &'static str,
    /// `module::name` globs; `*` matches any run of characters.
    pub patterns: &'static [&'static str],
}

/// Forbidden capability manifest.
pub const FORBIDDEN: &[ForbiddenClass] = &[
    ForbiddenClass {
        code: "NET_REACHABLE",
        patterns: &["*::sock_*", "*::socket*", "*::connect*", "*::fetch*", "*::http_*"],
    },
    ForbiddenClass {
        code: "FS_REACHABLE",
        patterns: &["*::fd_*", "*::path_*", "*::fs_*", "*::open*"],
    },
    ForbiddenClass {
        code: "PROC_REACHABLE",
        patterns: &["*::proc_*", "*::spawn*", "*::exec*", "*::thread_spawn"],
    },
    ForbiddenClass {
        code: "ENV_REACHABLE",
        patterns: &["*::environ_*", "*::args_*", "*::getenv*"],
    },
    ForbiddenClass {
        code: "CLOCK_REACHABLE",
        patterns: &["*::clock_*", "*::random_get"],
    },
];

/// Guest imports the host does not provide.
pub const IMPORT_UNRESOLVED: &str = "IMPORT_UNRESOLVED";
/// Host exports outside the mediated surface.
pub const UNMEDIATED_EXPORT: &str = "UNMEDIATED_EXPORT";

/// Evaluates a surface report. Returns failure codes, sorted and
/// deduplicated; empty means the compartment passed.
pub fn evaluate(report: &SurfaceReport) -> Vec<String> {
    let mut codes = BTreeSet::new();

    for name in report.host_exports.iter().chain(&report.guest_imports) {
        for class in FORBIDDEN {
            if class.patterns.iter().any(|p| glob_match(p, name)) {
                codes.insert(class.code.to_string());
            }
        }
    }
    if report
        .host_exports
        .iter()
        .any(|e| !MEDIATED_SURFACE.contains(&e.as_str()))
    {
        codes.insert(UNMEDIATED_EXPORT.to_string());
    }
    if report
        .guest_imports
        .iter()
        .any(|i| !report.host_exports.contains(i))
    {
        codes.insert(IMPORT_UNRESOLVED.to_string());
    }

    codes.into_iter().collect()
}

fn glob_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((head, rest)) => {
            let Some(tail) = text.strip_prefix(head) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            (0..=tail.len())
                .filter(|&i| tail.is_char_boundary(i))
                .any(|i| glob_match(rest, &tail[i..]))
        }
    }
}
