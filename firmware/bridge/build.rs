use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

// Emits the cortex-m link args and exports PIJ1850_FW_VERSION as
// "<crate> <semver> (profile <profile>, <git describe|git unknown>)".

fn main() {
    // `.cargo/config.toml` is only picked up when building from this directory.
    let rustflags = env::var("CARGO_ENCODED_RUSTFLAGS").unwrap_or_default();
    for script in ["link.x", "defmt.x"] {
        if !rustflags.contains(script) {
            println!("cargo:rustc-link-arg=-T{script}");
        }
    }
    if !rustflags.contains("--nmagic") {
        println!("cargo:rustc-link-arg=--nmagic");
    }

    println!("cargo:rerun-if-changed=src/");
    if let Some(head) = repo_root().map(|r| r.join(".git").join("HEAD"))
        && head.exists()
    {
        println!("cargo:rerun-if-changed={}", head.display());
    }

    let name = env::var("CARGO_PKG_NAME").unwrap_or_else(|_| "unknown".to_string());
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let git = git_describe()
        .map(|d| format!("git {d}"))
        .unwrap_or_else(|| "git unknown".to_string());

    println!("cargo:rustc-env=PIJ1850_FW_VERSION={name} {version} (profile {profile}, {git})");
}

fn repo_root() -> Option<PathBuf> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").ok()?);
    manifest_dir.parent()?.parent().map(|p| p.to_path_buf())
}

fn git_describe() -> Option<String> {
    let root = repo_root()?;
    if fs::metadata(root.join(".git")).is_err() {
        return None;
    }
    let output = Command::new("git")
        .arg("-C")
        .arg(&root)
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}
