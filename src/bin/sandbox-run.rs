use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, process};

use log;

use sandbox::{logging, Error, ExtraMount, Network, SandboxRunner, SandboxSpec, WritablePaths};

fn usage() {
    let execname = env::args().next().unwrap_or_else(|| "sandbox-run".into());
    eprint!("Usage: {execname} [-h] [-b <backend>] [-C <dir>] [-W <dir>]... [-r] [-n]
          [-t <secs>] [-e NAME=VALUE]... [--tmpfs <dir>]... [--proc <dir>]...
          <rootfs> <cmd> [args ...]

Run a command chroot'd into <rootfs>, and report its output and exit status.
The command gets only the environment given with -e.

Options:
    -h                - Show this message
    -b --backend <n>  - chroot or linux-user-chroot.  Default from $SANDBOX_BACKEND,
                        else the best available.
    -C --chdir <dir>  - Working directory, relative to <rootfs>
    -W --rw <dir>     - Only this part of <rootfs> is writable.  May be repeated.
    -r --readonly     - Nothing in <rootfs> is writable
    -n --no-net       - No network access
    -t --timeout <s>  - Kill the command after this many seconds
    -e --env <N=V>    - Set an environment variable
       --tmpfs <dir>  - Empty, writable, directory at <dir> inside <rootfs>
       --proc <dir>   - Mount procfs at <dir> inside <rootfs>

eg.
  $ sudo {execname} -W build -C build /srv/rootfs make

");
}

fn main() -> Result<(), Error> {
    if let Err(err) = logging::setup() {
        eprintln!("Unable to setup logging: {}", err);
    }

    let mut rawargs = env::args().skip(1).collect::<Vec<String>>();
    let mut backend = String::new();
    let mut cwd = None;
    let mut writable: Option<Vec<PathBuf>> = None;
    let mut network = Network::Undefined;
    let mut timeout = None;
    let mut envs = vec![];
    let mut extra = vec![];

    let value = |rawargs: &mut Vec<String>| -> String {
        if rawargs.len() < 2 {
            eprintln!("{} expects an argument", rawargs[0]);
            process::exit(1);
        }
        rawargs.remove(1)
    };

    while !rawargs.is_empty() {
        if !rawargs[0].starts_with('-') {
            break;
        }
        let arg = rawargs[0].clone();
        match arg.as_str() {
            "-b" | "--backend" => backend = value(&mut rawargs),
            "-C" | "--chdir" => cwd = Some(PathBuf::from(value(&mut rawargs))),
            "-W" | "--rw" => writable
                .get_or_insert_with(Vec::new)
                .push(PathBuf::from(value(&mut rawargs))),
            "-r" | "--readonly" => {
                writable.get_or_insert_with(Vec::new);
            }
            "-n" | "--no-net" => network = Network::Isolated,
            "-t" | "--timeout" => {
                let secs = value(&mut rawargs);
                match secs.parse::<f64>() {
                    Ok(s) if s.is_finite() && s >= 0.0 => {
                        timeout = Some(Duration::from_secs_f64(s))
                    }
                    _ => {
                        eprintln!("Invalid timeout: {}", secs);
                        process::exit(1);
                    }
                }
            }
            "-e" | "--env" => {
                let var = value(&mut rawargs);
                match var.split_once('=') {
                    Some((k, v)) => envs.push((k.to_string(), v.to_string())),
                    None => {
                        eprintln!("Expected NAME=VALUE: {}", var);
                        process::exit(1);
                    }
                }
            }
            "--tmpfs" => extra.push(ExtraMount::tmpfs(value(&mut rawargs))),
            "--proc" => extra.push(ExtraMount::proc(value(&mut rawargs))),
            "--" => {
                rawargs.remove(0);
                break;
            }
            other => {
                usage();
                if other == "-h" || other == "--help" {
                    process::exit(0);
                }
                eprintln!("Unknown argument: {}", other);
                process::exit(1);
            }
        }
        rawargs.remove(0);
    }
    if rawargs.len() < 2 {
        usage();
        process::exit(1);
    }

    let rootfs = rawargs.remove(0);
    let mut spec = SandboxSpec::new(rootfs, rawargs)
        .backend(backend)
        .network(network);
    if let Some(cwd) = cwd {
        spec = spec.cwd(cwd);
    }
    if let Some(writable) = writable {
        spec = spec.writable(WritablePaths::only(writable));
    }
    if let Some(timeout) = timeout {
        spec = spec.timeout(timeout);
    }
    for (k, v) in envs {
        spec = spec.env(k, v);
    }
    for mount in extra {
        spec = spec.mount(mount);
    }

    let outcome = SandboxRunner::from_env()?.run(&spec)?;
    if let Some(cleanup) = &outcome.cleanup {
        log::error!("{}", cleanup);
    }
    let result = outcome.result;
    let _ = std::io::stdout().write_all(result.stdout());
    let _ = std::io::stderr().write_all(result.stderr());
    if result.timed_out() {
        log::warn!("Timed out");
    }

    let code = result.exit_code();
    // like a shell, 128+N for signal N
    process::exit(if code < 0 { 128 - code } else { code });
}
