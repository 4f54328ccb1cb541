use std::process::Command;

fn kiln() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kiln"));
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_run_on_cpu_prints_tensor() {
    let dir = tempfile::tempdir().unwrap();
    let out = kiln()
        .current_dir(dir.path())
        .args(["run", "--device", "cpu", "--seed", "7", "--check"])
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(out.status.success(), "stderr: {}", stderr);
    assert!(stdout.starts_with("tensor([["), "{}", stdout);
    assert_eq!(stdout.trim_end().lines().count(), 4, "{}", stdout);
    assert!(!stdout.contains("device="), "{}", stdout);
    assert!(stderr.contains("max abs error"), "{}", stderr);
}

#[test]
fn test_seed_makes_runs_reproducible() {
    let run = || {
        kiln()
            .args(["run", "--device", "cpu", "--seed", "11", "--shape", "2x3"])
            .output()
            .unwrap()
            .stdout
    };
    let (a, b) = (run(), run());
    assert_eq!(a, b);
    assert_eq!(String::from_utf8_lossy(&a).trim_end().lines().count(), 2);
}

#[test]
fn test_explain_needs_no_gpu() {
    let out = kiln().args(["explain"]).output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("%1 = square %0"), "{}", stdout);
    assert!(stdout.contains("@compute @workgroup_size(64)"), "{}", stdout);

    let out = kiln()
        .args(["explain", "--no-optimize", "--workgroup-size", "128"])
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(!stdout.contains("// optimized"), "{}", stdout);
    assert!(stdout.contains("@workgroup_size(128)"), "{}", stdout);
}

#[test]
fn test_invalid_workgroup_size_fails() {
    let out = kiln()
        .args(["explain", "--workgroup-size", "48"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.starts_with("error: "), "{}", stderr);
}

#[test]
fn test_config_file_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("kiln.toml"),
        "[compile]\nbackend = \"eager\"\ndump_dir = \"out\"\n",
    )
    .unwrap();
    let out = kiln()
        .current_dir(dir.path())
        .args(["run", "--device", "cpu"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let dumped: Vec<_> = std::fs::read_dir(dir.path().join("out"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(dumped.iter().any(|n| n.ends_with(".wgsl")), "{:?}", dumped);
    assert!(dumped.iter().any(|n| n.ends_with(".ir")), "{:?}", dumped);
}

#[test]
fn test_missing_gpu_fails_fast() {
    let out = kiln()
        .args(["run", "--device", "gpu:4096"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("error: no compatible GPU adapter for gpu:4096"), "{}", stderr);
    assert!(out.stdout.is_empty());
}

#[test]
fn test_default_run_squares_on_gpu_or_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let out = kiln().current_dir(dir.path()).output().unwrap();
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    match out.status.code() {
        Some(0) => {
            assert!(stdout.starts_with("tensor([["), "{}", stdout);
            assert_eq!(stdout.trim_end().lines().count(), 4, "{}", stdout);
            assert!(stdout.trim_end().ends_with("device='gpu:0')"), "{}", stdout);
        }
        Some(1) => {
            assert!(stderr.contains("error: no compatible GPU adapter"), "{}", stderr);
            assert!(stdout.is_empty(), "{}", stdout);
        }
        other => panic!("unexpected exit {:?}: {}", other, stderr),
    }
}

#[test]
fn test_oversized_shape_is_rejected_without_panic() {
    let out = kiln()
        .args(["run", "--device", "cpu", "--shape", "4294967296x4294967296"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert_ne!(out.status.code(), Some(101));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("error:"), "{}", stderr);
    assert!(stderr.contains("too many elements"), "{}", stderr);
    assert!(!stderr.contains("panicked"), "{}", stderr);
    assert!(out.stdout.is_empty());
}

#[test]
fn test_bad_device_is_a_usage_error() {
    let out = kiln().args(["run", "--device", "tpu"]).output().unwrap();
    assert!(!out.status.success());
}
