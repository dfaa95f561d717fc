use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv6Addr, TcpStream};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn run_relay(vars: &[(&str, &str)]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tlsrelay"))
        .env_clear()
        .envs(vars.iter().copied())
        .output()
        .expect("failed to run tlsrelay")
}

/// A relay process started with a valid credential on an ephemeral port.
struct RunningRelay {
    child: Child,
    lines: mpsc::Receiver<String>,
    log: Vec<String>,
    _cert_file: NamedTempFile,
    _key_file: NamedTempFile,
}

impl RunningRelay {
    fn start() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file
            .write_all(cert.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let mut child = Command::new(env!("CARGO_BIN_EXE_tlsrelay"))
            .env_clear()
            .env("TLSPROXY_TARGET", "127.0.0.1")
            .env("TLSPROXY_PORTS", "0:9")
            .env("TLSPROXY_CERT_FILE", cert_file.path())
            .env("TLSPROXY_KEY_FILE", key_file.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn tlsrelay");

        let stdout = child.stdout.take().unwrap();
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Self {
            child,
            lines,
            log: Vec::new(),
            _cert_file: cert_file,
            _key_file: key_file,
        }
    }

    /// Collect log lines until one contains `needle`.
    fn wait_for_log(&mut self, needle: &str) -> String {
        let deadline = Instant::now() + TEST_TIMEOUT;
        loop {
            if let Some(line) = self.log.iter().find(|l| l.contains(needle)) {
                return line.clone();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(line) => self.log.push(line),
                Err(_) => panic!("no log line containing {needle:?}; log: {:#?}", self.log),
            }
        }
    }

    /// Port of the single listener, taken from its `bind_addr` log field.
    fn wait_for_listen_port(&mut self) -> u16 {
        let line = self.wait_for_log("Listener bound");
        let addr = line
            .split("\"bind_addr\":\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap_or_else(|| panic!("no bind_addr in {line}"));
        assert!(addr.starts_with("[::]:"), "default listen host should be ::, got {addr}");
        addr.rsplit(':').next().unwrap().parse().unwrap()
    }

    fn signal(&self, name: &str) {
        let status = Command::new("kill")
            .args(["-s", name.trim_start_matches("SIG")])
            .arg(self.child.id().to_string())
            .status()
            .expect("failed to run kill");
        assert!(status.success());
    }

    fn wait_exit(&mut self) -> ExitStatus {
        let deadline = Instant::now() + TEST_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                panic!("tlsrelay did not exit after the signal");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn assert_signal_shutdown(signal: &str) {
    let mut relay = RunningRelay::start();
    let port = relay.wait_for_listen_port();
    relay.wait_for_log("Proxy running");

    // An open connection mid-handshake must not hold up the exit.
    let _client = TcpStream::connect((Ipv6Addr::LOCALHOST, port)).unwrap();

    relay.signal(signal);
    let status = relay.wait_exit();
    assert!(status.success(), "exit status: {status}");

    relay.wait_for_log(&format!("Quit ({signal})"));
    relay.wait_for_log("terminated");
}

#[test]
fn missing_target_is_fatal() {
    let output = run_relay(&[("TLSPROXY_PORTS", "8443:80")]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TLSPROXY_TARGET"), "stderr: {stderr}");
}

#[test]
fn missing_ports_is_fatal() {
    let output = run_relay(&[("TLSPROXY_TARGET", "backend.local")]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TLSPROXY_PORTS"), "stderr: {stderr}");
}

#[test]
fn unreadable_credential_is_fatal() {
    let output = run_relay(&[
        ("TLSPROXY_TARGET", "backend.local"),
        ("TLSPROXY_PORTS", "0"),
        ("TLSPROXY_CERT_FILE", "/nonexistent/server.crt"),
        ("TLSPROXY_KEY_FILE", "/nonexistent/server.key"),
    ]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TLS credential"), "stderr: {stderr}");
}

#[test]
fn sigterm_exits_cleanly() {
    assert_signal_shutdown("SIGTERM");
}

#[test]
fn sigint_exits_cleanly() {
    assert_signal_shutdown("SIGINT");
}
