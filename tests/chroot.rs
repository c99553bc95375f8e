mod common;

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use sandbox::{
    run_sandbox, run_sandbox_with_redirection, Config, Error, ExtraMount, Redirect,
    SandboxRunner, SandboxSpec, WritablePaths, CHROOT,
};

use common::{exists_check, path_env, privileged, Rootfs};

fn runner() -> SandboxRunner {
    SandboxRunner::new(Config::default())
}

#[test]
fn true_exits_zero() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let outcome = runner()
        .run(&SandboxSpec::new(rootfs.path(), ["/bin/true"]))
        .unwrap();
    assert!(outcome.cleanup.is_none());
    assert_eq!(outcome.result.exit_code(), 0);
    assert!(outcome.result.stdout().is_empty());
}

#[test]
fn file_exists_check() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();

    let spec = SandboxSpec::new(rootfs.path(), exists_check("/etc/hostname"));
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.stdout(), b"/etc/hostname exists\n");

    // the host side path is not visible
    let host = rootfs.path().join("etc/hostname");
    let spec = SandboxSpec::new(rootfs.path(), exists_check(&host.display().to_string()));
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert_eq!(result.exit_code(), 2);
    assert_eq!(
        String::from_utf8_lossy(result.stdout()),
        format!("Did not find {}.\n", host.display())
    );
}

#[test]
fn cwd_and_env() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let spec = SandboxSpec::new(rootfs.path(), ["/bin/sh", "-c", "pwd; echo \"[$FOO][$HOME]\""])
        .cwd("work/sub")
        .env("FOO", "bar");
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.stdout(), b"/work/sub\n[bar][]\n");
}

#[test]
fn writable_round_trip() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let before = rootfs.mount_ids();

    let spec = SandboxSpec::new(rootfs.path(), ["/bin/sh", "-c", "echo hello > /work/sub/out"])
        .writable(WritablePaths::only(["work"]));
    let outcome = runner().run(&spec).unwrap();
    assert!(outcome.cleanup.is_none());
    assert_eq!(outcome.result.exit_code(), 0, "{:?}", outcome.result);
    assert_eq!(
        std::fs::read_to_string(rootfs.path().join("work/sub/out")).unwrap(),
        "hello\n"
    );
    assert_eq!(rootfs.mount_ids(), before);
}

#[test]
fn readonly_rejected() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let before = rootfs.mount_ids();

    let spec = SandboxSpec::new(rootfs.path(), ["/bin/sh", "-c", "echo hello > /tmp/out"])
        .writable(WritablePaths::only(["work"]));
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert_ne!(result.exit_code(), 0);
    assert!(
        String::from_utf8_lossy(result.stderr()).contains("Read-only file system"),
        "{:?}",
        result
    );
    assert!(!rootfs.path().join("tmp/out").exists());

    // all read-only
    let spec = SandboxSpec::new(rootfs.path(), ["/bin/sh", "-c", "echo hello > /work/out"])
        .writable(WritablePaths::none());
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert_ne!(result.exit_code(), 0);
    assert!(!rootfs.path().join("work/out").exists());

    assert_eq!(rootfs.mount_ids(), before);
}

#[test]
fn unspecified_is_writable() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let spec = SandboxSpec::new(rootfs.path(), ["/bin/sh", "-c", "echo hello > /tmp/out"]);
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert_eq!(result.exit_code(), 0);
    assert!(rootfs.path().join("tmp/out").is_file());
}

#[test]
fn tmpfs_mount() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let before = rootfs.mount_ids();

    let spec = SandboxSpec::new(
        rootfs.path(),
        ["/bin/sh", "-c", "echo hello > /scratch/out && cat /scratch/out"],
    )
    .writable(WritablePaths::none())
    .mount(ExtraMount::tmpfs("scratch"));
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert_eq!(result.exit_code(), 0, "{:?}", result);
    assert_eq!(result.stdout(), b"hello\n");

    // mount point created, and removed again
    assert!(!rootfs.path().join("scratch").exists());
    assert_eq!(rootfs.mount_ids(), before);
}

#[test]
fn proc_mount() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let before = rootfs.mount_ids();

    let spec = SandboxSpec::new(rootfs.path(), exists_check("/proc/self/status"))
        .writable(WritablePaths::none())
        .mount(ExtraMount::proc("proc"));
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert_eq!(result.exit_code(), 0, "{:?}", result);

    assert!(!rootfs.path().join("proc").exists());
    assert_eq!(rootfs.mount_ids(), before);
}

#[test]
fn output_to_file() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let out = tempfile::NamedTempFile::new().unwrap();

    let spec = SandboxSpec::new(rootfs.path(), ["/bin/sh", "-c", "echo hello; echo oops >&2; exit 6"])
        .stdout(Redirect::Fd(out.as_file().as_raw_fd()))
        .stderr(Redirect::ToStdout);
    let code = run_sandbox_with_redirection(&spec).unwrap();
    assert_eq!(code, 6);
    assert_eq!(std::fs::read_to_string(out.path()).unwrap(), "hello\noops\n");
}

#[test]
fn killed_after_timeout() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let before = rootfs.mount_ids();

    let mut spec = SandboxSpec::new(rootfs.path(), ["sleep", "30"])
        .writable(WritablePaths::only(["work"]))
        .timeout(Duration::from_millis(300));
    spec.env = path_env();
    let result = runner().run(&spec).unwrap().into_result().unwrap();
    assert!(result.timed_out());
    assert_eq!(result.exit_code(), -libc::SIGTERM);
    assert_eq!(rootfs.mount_ids(), before);
}

#[test]
fn missing_program() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let before = rootfs.mount_ids();

    let spec = SandboxSpec::new(rootfs.path(), ["/no/such/program"])
        .writable(WritablePaths::only(["work"]));
    let err = runner().run(&spec).unwrap_err();
    assert!(matches!(err, Error::Execution { .. }), "{}", err);
    assert_eq!(rootfs.mount_ids(), before);
}

#[test]
fn convenience() {
    if !privileged() {
        return;
    }
    let rootfs = Rootfs::new();
    let result = run_sandbox(
        rootfs.path(),
        &["/bin/sh", "-c", "echo $PATH"],
        CHROOT,
        Some(std::path::Path::new("work")),
        &path_env(),
        &[],
    )
    .unwrap();
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.stdout(), b"/usr/bin:/bin\n");
}

#[test]
fn rejected_before_mounting() {
    let rootfs = tempfile::tempdir().unwrap();

    let spec = SandboxSpec::new(rootfs.path(), ["/bin/true"]).backend("nonesuch");
    let err = runner().run(&spec).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{}", err);
    assert!(err.to_string().contains("unknown backend"), "{}", err);

    let spec = SandboxSpec::new(rootfs.path(), ["/bin/true"])
        .writable(WritablePaths::only(["../"]));
    let err = runner().run(&spec).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{}", err);

    let spec = SandboxSpec::new(rootfs.path().join("missing"), ["/bin/true"]);
    let err = runner().run(&spec).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{}", err);
}
