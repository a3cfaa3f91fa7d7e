//! Assembly of the fixed deploy shell script.
//!
//! The script is the only place the pipeline shells out. Credentials reach
//! it exclusively through the environment (`CARAVEL_CLONE_URL`,
//! `HOSTING_KEY`, `HOSTING_SECRET`), never through argv or the script text,
//! so they stay out of process listings and build logs.

use std::fmt::Write as _;
use std::path::Path;

/// Inputs for one script. Borrowed from the job; the script itself contains
/// no secret material.
#[derive(Debug)]
pub struct ScriptSpec<'a> {
    /// Ephemeral working directory for this run.
    pub workdir: &'a Path,
    /// Deploy an existing directory instead of cloning.
    pub prebuilt_dir: Option<&'a str>,
    /// Branch to clone (ignored for prebuilt deploys).
    pub branch: &'a str,
    pub install_command: Option<&'a str>,
    pub build_command: Option<&'a str>,
    /// Directory to upload, relative to the source root.
    pub output_dir: &'a str,
    pub site_id: &'a str,
    /// Upload CLI binary. Overridable so tests can substitute a stub.
    pub upload_bin: &'a str,
}

/// Render the deploy script for `sh -c`.
pub fn build_script(spec: &ScriptSpec<'_>) -> String {
    // Plain `set -eu`: the script must run under any POSIX sh.
    let mut script = String::from("set -eu\n");

    if let Some(prebuilt) = spec.prebuilt_dir {
        let _ = writeln!(script, "cd \"{prebuilt}\"");
    } else {
        let src = spec.workdir.join("src");
        let _ = writeln!(
            script,
            "git clone --depth 1 --branch \"{}\" \"$CARAVEL_CLONE_URL\" \"{}\"",
            spec.branch,
            src.display()
        );
        let _ = writeln!(script, "cd \"{}\"", src.display());
    }

    if let Some(install) = spec.install_command {
        let _ = writeln!(script, "{install}");
    }
    if let Some(build) = spec.build_command {
        let _ = writeln!(script, "{build}");
    }

    let _ = writeln!(
        script,
        "{} upload --site \"{}\" --dir \"{}\"",
        spec.upload_bin, spec.site_id, spec.output_dir
    );

    script
}
