use std::process::Command;

fn main() {
    // git version for the startup banner
    let git_hash = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);

    // audio extraction shells out to ffmpeg/ffprobe at runtime
    for tool in ["ffmpeg", "ffprobe"] {
        if Command::new(tool).arg("-version").output().is_err() {
            println!("cargo:warning={} not found in PATH, audio extraction will fail at runtime", tool);
        }
    }
}
