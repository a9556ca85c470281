use std::process::{Command, Stdio};

/// Program and leading arguments that open a URL on `os`
/// (a `std::env::consts::OS` value).
fn launcher(os: &str) -> (&'static str, &'static [&'static str]) {
    match os {
        "macos" => ("open", &[]),
        "windows" => ("cmd", &["/c", "start"]),
        _ => ("xdg-open", &[]),
    }
}

fn command_for(os: &str, url: &str) -> Command {
    let (program, args) = launcher(os);
    let mut cmd = Command::new(program);
    cmd.args(args)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Try to open `url` in the desktop browser. Returns whether the launcher started.
pub fn open(url: &str) -> bool {
    match command_for(std::env::consts::OS, url).spawn() {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "could not launch browser");
            false
        }
    }
}
