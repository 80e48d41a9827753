use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn main() {
    let version = [
        (
            "GIT_HASH",
            git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".into()),
        ),
        (
            "GIT_TAG",
            git(&["describe", "--tags", "--abbrev=0"])
                .unwrap_or_else(|| std::env::var("CARGO_PKG_VERSION").unwrap_or_default()),
        ),
        ("BUILD_TIME", chrono::Utc::now().to_rfc3339()),
    ];

    // Read back by `burrow --version`
    for (key, value) in version {
        println!("cargo:rustc-env={key}={value}");
    }

    for path in [".git/HEAD", ".git/refs"] {
        println!("cargo:rerun-if-changed={path}");
    }
}
