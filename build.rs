use std::process::Command;

fn main() {
    // Embed the short git commit for the version banner; archives/CI builds
    // fall back to "unknown".
    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_COMMIT_HASH={}", commit);

    let mut features: Vec<String> = std::env::vars()
        .filter(|(k, v)| k.starts_with("CARGO_FEATURE_") && v == "1")
        .map(|(k, _)| {
            k["CARGO_FEATURE_".len()..]
                .to_ascii_lowercase()
                .replace('_', "-")
        })
        .collect();
    features.sort();
    println!("cargo:rustc-env=CARGO_FEATURES={}", features.join(","));

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
}
