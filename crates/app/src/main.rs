mod channel;
mod exitcode;
mod loadconfig;
mod section;
mod status;
mod system;
mod tasks;
mod template;

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use clap::Parser;

/// Last fatal signal received; 0 while running.
static STOP_SIGNAL: AtomicI32 = AtomicI32::new(0);
/// Runtime-adjustable verbosity (SIGUSR1/SIGUSR2).
static VERBOSITY: AtomicI32 = AtomicI32::new(0);

pub fn main_verbosity_add(n: i32) {
    let v = VERBOSITY.load(Ordering::Relaxed) + n;
    VERBOSITY.store(v.max(0), Ordering::Relaxed);
}

pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

#[derive(Parser, Debug)]
#[command(name = "radiod", disable_version_flag = true)]
#[command(about = "Multichannel SDR receiver daemon")]
struct Cli {
    /// Instance name (defaults to the config path)
    #[arg(short = 'N', long = "name")]
    name: Option<String>,

    /// FFT planning time limit in seconds
    #[arg(short = 'p', long = "fft-time-limit")]
    fft_time_limit: Option<f64>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print version and exit
    #[arg(short = 'V')]
    version: bool,

    /// Configuration file or directory
    config: Option<PathBuf>,
}

extern "C" fn closedown_handler(sig: libc::c_int) {
    STOP_SIGNAL.store(sig, Ordering::SeqCst);
}

extern "C" fn verbosity_handler(sig: libc::c_int) {
    let v = VERBOSITY.load(Ordering::SeqCst);
    let v = if sig == libc::SIGUSR1 { v + 1 } else { v - 1 };
    VERBOSITY.store(v.max(0), Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, closedown_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, closedown_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, closedown_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGUSR1, verbosity_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, verbosity_handler as *const () as libc::sighandler_t);
    }
}

fn clock_seconds(clock: libc::clockid_t) -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    eprintln!(
        "radiod {} multichannel receiver",
        env!("CARGO_PKG_VERSION")
    );

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(exitcode::USAGE);
        }
    };
    if cli.version {
        std::process::exit(exitcode::OK);
    }
    main_verbosity_add(cli.verbose as i32);

    // The display tooling assumes a locale with a thousands-grouping
    // character; honor $LANG the way the terminal UIs expect.
    let locale = std::env::var("LANG").unwrap_or_else(|_| "en_US.UTF-8".to_string());
    if let Ok(cl) = CString::new(locale) {
        unsafe {
            libc::setlocale(libc::LC_ALL, cl.as_ptr());
        }
    }

    install_signal_handlers();

    let Some(config) = cli.config else {
        eprintln!("config file missing");
        std::process::exit(exitcode::NOINPUT);
    };
    let name = cli
        .name
        .unwrap_or_else(|| config.display().to_string());

    let (sys, nchans) = match loadconfig::load_and_start(&config, &name, cli.fft_time_limit) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    };
    log::info!(
        "{}: {} at {} Hz, blocktime {} ms, overlap {}",
        sys.name,
        sys.description,
        sys.frontend.samprate,
        sys.blocktime_ms,
        sys.overlap
    );
    eprintln!("{} total demodulators started", nchans);
    if !sys.ctl_active && nchans == 0 {
        eprintln!("warning: no control channel and no static demodulators, radiod won't do anything");
    }

    // Supervisor: watch for signals, account CPU once a minute when verbose
    let start_real = clock_seconds(libc::CLOCK_MONOTONIC);
    let mut last_real = start_real;
    let mut last_cpu = 0.0f64;
    let mut tick = 0u64;

    loop {
        std::thread::sleep(Duration::from_secs(1));

        let sig = STOP_SIGNAL.load(Ordering::SeqCst);
        if sig != 0 {
            eprintln!("received signal, shutting down");
            sys.stop.store(true, Ordering::SeqCst);
            // Drain window for threads to notice the flag
            std::thread::sleep(Duration::from_secs(1));
            std::process::exit(if sig == libc::SIGTERM {
                exitcode::OK
            } else {
                exitcode::SOFTWARE
            });
        }

        tick += 1;
        if tick % 60 == 0 && verbosity() > 0 {
            let now_real = clock_seconds(libc::CLOCK_MONOTONIC);
            let now_cpu = clock_seconds(libc::CLOCK_PROCESS_CPUTIME_ID);
            let total_real = now_real - start_real;
            let period_real = now_real - last_real;
            let period_cpu = now_cpu - last_cpu;
            eprintln!(
                "CPU usage: {:.1}% since start, {:.1}% in last {:.1} sec",
                100.0 * now_cpu / total_real,
                100.0 * period_cpu / period_real,
                period_real
            );
            last_real = now_real;
            last_cpu = now_cpu;
        }
    }
}
