use std::{
    borrow::Cow,
    env,
    ffi::OsString,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::{anyhow, Context as _, Result};
use cargo_metadata::{Artifact, CompilerMessage, Message, Target};

/// Binary name of the XDP object, see crates/vlanredir-ebpf/Cargo.toml.
const EBPF_BINARY: &str = "vlanredir";

const TOOLCHAIN: &str = "nightly";

/// Set to skip the eBPF build (CI hosts without bpf-linker).
const SKIP_ENV: &str = "VLANREDIR_SKIP_EBPF";

fn main() -> Result<()> {
    let manifest_dir =
        env::var_os("CARGO_MANIFEST_DIR").ok_or(anyhow!("CARGO_MANIFEST_DIR not set"))?;
    let crates_dir = PathBuf::from(manifest_dir)
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("vlanredird has no parent directory"))?;
    let ebpf_dir = crates_dir.join("vlanredir-ebpf");
    let common_dir = crates_dir.join("vlanredir-common");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or(anyhow!("OUT_DIR not set"))?);
    let dst = out_dir.join(EBPF_BINARY);

    println!("cargo:rerun-if-changed={}", ebpf_dir.display());
    println!("cargo:rerun-if-changed={}", common_dir.display());
    println!("cargo:rerun-if-env-changed={SKIP_ENV}");

    if env::var_os(SKIP_ENV).is_some() {
        return write_placeholder(&dst, &format!("{SKIP_ENV} is set"));
    }

    match build_ebpf(&ebpf_dir, &out_dir) {
        Ok(()) => Ok(()),
        Err(err) => write_placeholder(&dst, &format!("{err:#}")),
    }
}

/// An empty object makes the daemon fail at attach time with a clear error
/// instead of failing the whole workspace build.
fn write_placeholder(dst: &Path, reason: &str) -> Result<()> {
    println!("cargo:warning=XDP program not built: {reason}");
    fs::write(dst, []).with_context(|| format!("failed to write placeholder {dst:?}"))
}

fn build_ebpf(ebpf_dir: &Path, out_dir: &Path) -> Result<()> {
    let endian =
        env::var_os("CARGO_CFG_TARGET_ENDIAN").ok_or(anyhow!("CARGO_CFG_TARGET_ENDIAN not set"))?;
    let target = match endian.as_os_str().to_string_lossy().as_ref() {
        "big" => "bpfeb",
        "little" => "bpfel",
        other => return Err(anyhow!("unsupported endian={other}")),
    };

    const TARGET_ARCH: &str = "CARGO_CFG_TARGET_ARCH";
    let bpf_target_arch = env::var(TARGET_ARCH).with_context(|| format!("{TARGET_ARCH} not set"))?;
    let bpf_target_arch = target_arch_fixup(bpf_target_arch.into()).into_owned();
    let target = format!("{target}-unknown-none");

    let manifest_path = ebpf_dir.join("Cargo.toml");
    let mut cmd = Command::new("rustup");
    cmd.args(["run", TOOLCHAIN, "cargo", "build", "--manifest-path"])
        .arg(&manifest_path)
        .args([
            "-Z",
            "build-std=core",
            "--bins",
            "--message-format=json",
            "--release",
            "--target",
            &target,
        ]);

    const SEPARATOR: &str = "\x1f";
    let mut rustflags = OsString::new();
    for part in [
        "--cfg=bpf_target_arch=\"",
        &bpf_target_arch,
        "\"",
        SEPARATOR,
        "-Cdebuginfo=2",
        SEPARATOR,
        "-Clink-arg=--btf",
    ] {
        rustflags.push(part);
    }
    cmd.env("CARGO_ENCODED_RUSTFLAGS", rustflags);

    for key in ["RUSTC", "RUSTC_WORKSPACE_WRAPPER"] {
        cmd.env_remove(key);
    }

    let target_dir = out_dir.join("vlanredir-ebpf");
    cmd.arg("--target-dir").arg(&target_dir);

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {cmd:?}"))?;
    let Child { stdout, stderr, .. } = &mut child;

    let stderr = stderr.take().ok_or(anyhow!("stderr not captured"))?;
    let stderr = BufReader::new(stderr);
    let stderr_handle = thread::spawn(move || {
        for line in stderr.lines() {
            match line {
                Ok(line) => eprintln!("[ebpf] {line}"),
                Err(err) => eprintln!("[ebpf] failed to read stderr: {err}"),
            }
        }
    });

    let stdout = stdout.take().ok_or(anyhow!("stdout not captured"))?;
    let stdout = BufReader::new(stdout);
    let mut executables = Vec::new();
    for message in Message::parse_stream(stdout) {
        match message.context("invalid cargo JSON message")? {
            Message::CompilerArtifact(Artifact {
                executable: Some(executable),
                target: Target { name, .. },
                ..
            }) => {
                executables.push((name, executable.into_std_path_buf()));
            }
            Message::CompilerArtifact(Artifact { .. }) => {}
            Message::CompilerMessage(CompilerMessage { message, .. }) => {
                if let Some(rendered) = message.rendered {
                    for line in rendered.lines() {
                        eprintln!("[ebpf] {line}");
                    }
                }
            }
            Message::TextLine(line) => {
                eprintln!("[ebpf] {line}");
            }
            _ => {}
        }
    }

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {cmd:?}"))?;
    if !status.success() {
        return Err(anyhow!("{cmd:?} failed: {status:?}"));
    }

    stderr_handle
        .join()
        .unwrap_or_else(|err| std::panic::resume_unwind(err));

    for (name, binary) in executables {
        let dst = out_dir.join(name);
        fs::copy(&binary, &dst).with_context(|| format!("failed to copy {binary:?} to {dst:?}"))?;
    }

    if !out_dir.join(EBPF_BINARY).exists() {
        return Err(anyhow!("no {EBPF_BINARY} artifact produced"));
    }

    Ok(())
}

fn target_arch_fixup(target_arch: Cow<'_, str>) -> Cow<'_, str> {
    if target_arch.starts_with("riscv64") {
        "riscv64".into()
    } else {
        target_arch
    }
}
