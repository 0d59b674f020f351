// ABOUTME: Integration tests for SSH sessions and remote commands.
// ABOUTME: Tests run against an in-process russh server on an ephemeral port.

mod support;

use russh::keys::PublicKey;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::keys::{self, CLIENT, CLIENT_PASSPHRASE, CLIENT_PROTECTED, HOST_A, HOST_B};
use support::ssh_server::{BANNER, PASSWORD, TestServer};
use tether::ssh::{
    Auth, Error, FileKnownHosts, HostKeyPolicy, KnownHostsStore, RemoteCommandSpec, Session,
};
use tether::types::HostIdentity;
use tokio_util::sync::CancellationToken;

async fn trust(path: &Path, server: &TestServer, key: &PublicKey) {
    let identity = HostIdentity::new("127.0.0.1", server.port()).unwrap();
    FileKnownHosts::new(path)
        .append(&[identity], key)
        .await
        .expect("seeding known_hosts should succeed");
}

/// Server plus a known_hosts file that already trusts its key.
async fn trusted_server() -> (TestServer, tempfile::TempDir) {
    support::init_tracing();
    let server = TestServer::start(HOST_A).await;
    let dir = tempfile::tempdir().unwrap();
    trust(&dir.path().join("known_hosts"), &server, server.host_key()).await;
    (server, dir)
}

async fn connect(server: &TestServer, dir: &tempfile::TempDir) -> Session {
    let config = server
        .session_config()
        .known_hosts_path(dir.path().join("known_hosts"));
    Session::connect_known_hosts(config, Auth::password(PASSWORD))
        .await
        .expect("connection should succeed")
}

mod connecting {
    use super::*;

    /// Test: Connect to a trusted host with a password and run `echo hello`.
    /// Expected: Returns "hello" with exit code 0.
    #[tokio::test]
    async fn connect_and_execute_echo() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let output = session
            .exec("echo hello")
            .await
            .expect("command should succeed");

        assert!(output.success(), "exit code should be 0");
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert_eq!(session.host_key().key_data(), server.host_key().key_data());
        assert_eq!(session.banner().as_deref(), Some(BANNER));

        session
            .disconnect()
            .await
            .expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn key_file_authentication() {
        let (server, dir) = trusted_server().await;
        let config = server
            .session_config()
            .known_hosts_path(dir.path().join("known_hosts"));
        let auth = Auth::key_file(keys::fixture_path(CLIENT), None).unwrap();

        let session = Session::connect_known_hosts(config, auth)
            .await
            .expect("key authentication should succeed");
        assert!(session.exec("echo ok").await.unwrap().success());
    }

    #[tokio::test]
    async fn encrypted_key_with_passphrase() {
        let (server, dir) = trusted_server().await;
        let config = server
            .session_config()
            .known_hosts_path(dir.path().join("known_hosts"));
        // The server only knows the unprotected client key, so the protected
        // one is rejected and the password fallback is used.
        let auth = Auth::key_file(keys::fixture_path(CLIENT_PROTECTED), Some(CLIENT_PASSPHRASE))
            .unwrap()
            .with(tether::ssh::AuthMethod::Password(PASSWORD.to_string()));

        let session = Session::connect_known_hosts(config, auth).await.unwrap();
        assert!(session.exec("echo ok").await.unwrap().success());
        assert!(server.state().auth_attempts() >= 2);
    }

    #[tokio::test]
    async fn unreachable_agent_falls_back_to_next_method() {
        let (server, dir) = trusted_server().await;
        let config = server
            .session_config()
            .known_hosts_path(dir.path().join("known_hosts"));
        let auth = Auth::agent().with(tether::ssh::AuthMethod::Password(PASSWORD.to_string()));
        let sock = dir.path().join("no-agent.sock");

        let result = temp_env::async_with_vars(
            [("SSH_AUTH_SOCK", Some(sock.as_os_str()))],
            Session::connect_known_hosts(config, auth),
        )
        .await;

        let session = result.expect("password should be tried after the agent");
        assert!(session.exec("echo ok").await.unwrap().success());
    }

    #[tokio::test]
    async fn only_an_unreachable_agent_fails_authentication() {
        let (server, dir) = trusted_server().await;
        let config = server
            .session_config()
            .known_hosts_path(dir.path().join("known_hosts"));
        let sock = dir.path().join("no-agent.sock");

        let result = temp_env::async_with_vars(
            [("SSH_AUTH_SOCK", Some(sock.as_os_str()))],
            Session::connect_known_hosts(config, Auth::agent()),
        )
        .await;

        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn discovered_default_key_is_used_when_agent_is_unreachable() {
        let (server, dir) = trusted_server().await;
        let config = server
            .session_config()
            .known_hosts_path(dir.path().join("known_hosts"));
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join(".ssh")).unwrap();
        std::fs::copy(
            keys::fixture_path(CLIENT),
            home.path().join(".ssh").join("id_ed25519"),
        )
        .unwrap();
        let sock = dir.path().join("no-agent.sock");

        let result = temp_env::async_with_vars(
            [
                ("SSH_AUTH_SOCK", Some(sock.as_os_str())),
                ("HOME", Some(home.path().as_os_str())),
            ],
            async {
                let auth = Auth::discover()?;
                let names: Vec<_> = auth.methods().map(|m| m.name()).collect();
                assert_eq!(names, ["agent", "publickey"]);
                Session::connect_known_hosts(config, auth).await
            },
        )
        .await;

        let session = result.expect("default key should authenticate");
        assert!(session.exec("echo ok").await.unwrap().success());
    }

    #[tokio::test]
    async fn wrong_password_fails_authentication() {
        let (server, dir) = trusted_server().await;
        let config = server
            .session_config()
            .known_hosts_path(dir.path().join("known_hosts"));

        let result = Session::connect_known_hosts(config, Auth::password("nope")).await;
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn connection_refused_is_a_connection_error() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = tether::ssh::SessionConfig::new("127.0.0.1", "tester")
            .port(port)
            .connect_timeout(Duration::from_secs(5));

        let result = Session::connect_insecure(config, Auth::password(PASSWORD)).await;
        assert!(matches!(result, Err(Error::Connection(_))), "{:?}", result.err());
    }
}

mod host_keys {
    use super::*;

    #[tokio::test]
    async fn unknown_host_is_refused_under_strict_policy() {
        support::init_tracing();
        let server = TestServer::start(HOST_A).await;
        let dir = tempfile::tempdir().unwrap();
        let config = server
            .session_config()
            .known_hosts_path(dir.path().join("known_hosts"));

        let result = Session::connect_known_hosts(config, Auth::password(PASSWORD)).await;

        assert!(matches!(result, Err(Error::HostUnknown { .. })));
        assert_eq!(server.state().auth_attempts(), 0);
    }

    #[tokio::test]
    async fn accept_new_records_key_for_later_connections() {
        support::init_tracing();
        let server = TestServer::start(HOST_A).await;
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");

        let config = server
            .session_config()
            .known_hosts_path(&known_hosts)
            .host_key_policy(HostKeyPolicy::AcceptNew);
        Session::connect_known_hosts(config, Auth::password(PASSWORD))
            .await
            .expect("first connection should be accepted")
            .disconnect()
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&known_hosts).unwrap();
        assert!(contents.starts_with(&format!("[127.0.0.1]:{} ssh-ed25519 ", server.port())));

        let strict = server.session_config().known_hosts_path(&known_hosts);
        Session::connect_known_hosts(strict, Auth::password(PASSWORD))
            .await
            .expect("recorded host should now be trusted");
    }

    /// Test: The server presents key A while known_hosts trusts key B.
    /// Expected: HostKeyMismatch, and the server never sees an auth attempt.
    #[tokio::test]
    async fn mismatched_key_aborts_before_authentication() {
        support::init_tracing();
        let server = TestServer::start(HOST_A).await;
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        trust(&known_hosts, &server, &keys::public_key(HOST_B)).await;

        let config = server
            .session_config()
            .known_hosts_path(&known_hosts)
            .host_key_policy(HostKeyPolicy::AcceptNew);
        let result = Session::connect_known_hosts(config, Auth::password(PASSWORD)).await;

        match result {
            Err(Error::HostKeyMismatch {
                offered, trusted, ..
            }) => {
                assert_eq!(offered, tether::ssh::fingerprint(server.host_key()));
                assert_eq!(trusted, vec![tether::ssh::fingerprint(&keys::public_key(HOST_B))]);
            }
            other => panic!("expected HostKeyMismatch, got {:?}", other.err()),
        }
        assert_eq!(server.state().auth_attempts(), 0);

        // The mismatched key is not learned.
        let contents = std::fs::read_to_string(&known_hosts).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn custom_verifier_error_is_returned_unchanged() {
        support::init_tracing();
        let server = TestServer::start(HOST_A).await;
        let verifier =
            |host: &str, remote: Option<SocketAddr>, _key: &PublicKey| -> tether::ssh::Result<()> {
                assert!(remote.is_some());
                Err(Error::SecurityContext(format!("refusing {}", host)))
            };

        let result =
            Session::connect(server.session_config(), Auth::password(PASSWORD), Arc::new(verifier))
                .await;

        match result {
            Err(Error::SecurityContext(message)) => {
                assert_eq!(message, format!("refusing [127.0.0.1]:{}", server.port()));
            }
            other => panic!("expected the verifier's error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn insecure_connect_skips_known_hosts() {
        support::init_tracing();
        let server = TestServer::start(HOST_B).await;

        let session = Session::connect_insecure(server.session_config(), Auth::password(PASSWORD))
            .await
            .expect("insecure connection should succeed");
        assert!(session.exec("echo hi").await.unwrap().success());
    }
}

mod commands {
    use super::*;

    /// Test: Execute command that writes to stderr and exits non-zero.
    /// Expected: streams are separated and the exit status is reported.
    #[tokio::test]
    async fn nonzero_exit_with_stderr() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let output = session.exec("fail 3").await.expect("command should run");

        assert!(!output.success());
        assert_eq!(output.exit_status, 3);
        assert_eq!(output.stdout_lossy(), "partial\n");
        assert_eq!(output.stderr_lossy(), "failed\n");
    }

    #[tokio::test]
    async fn run_combines_output() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let output = session.run("fail 2").await.expect("command should run");

        assert_eq!(output.stdout_lossy(), "partial\nfailed\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn env_is_sent_before_exec() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let spec = RemoteCommandSpec::new("printenv")
            .arg("GREETING")
            .env("GREETING", "hola");
        let output = session.remote_command(spec).await.unwrap().run().await.unwrap();

        assert_eq!(output.stdout_lossy(), "hola\n");
        assert_eq!(
            server.state().env(),
            vec![("GREETING".to_string(), "hola".to_string())]
        );
    }

    #[tokio::test]
    async fn command_line_reaches_server_verbatim() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        session
            .command("echo", ["a", "b"])
            .await
            .unwrap()
            .run()
            .await
            .unwrap();
        let spec = RemoteCommandSpec::new("echo").arg("x").dir("/srv/app");
        session.remote_command(spec).await.unwrap().run().await.unwrap();

        assert_eq!(
            server.state().commands(),
            vec!["echo a b".to_string(), "cd /srv/app && echo x".to_string()]
        );
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let spec = RemoteCommandSpec::new("cat").stdin("ping");
        let output = session.remote_command(spec).await.unwrap().run().await.unwrap();

        assert_eq!(output.stdout_lossy(), "ping");
    }

    /// Test: Cancel `sleep 10` after 100ms.
    /// Expected: Cancelled returns promptly and the server receives SIGINT.
    #[tokio::test]
    async fn cancellation_interrupts_remote_command() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let result = session.run_with_cancellation("sleep 10", token).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            server.state().wait_for_signal(Duration::from_secs(2)).await,
            Some("INT".to_string())
        );
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn completion_before_cancellation_returns_result() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let token = CancellationToken::new();
        let output = session
            .run_with_cancellation("echo done", token.clone())
            .await
            .expect("command should finish first");
        token.cancel();

        assert_eq!(output.stdout_lossy(), "done\n");
        assert!(server.state().signals().is_empty());
    }

    #[tokio::test]
    async fn timeout_interrupts_and_reports() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let result = session
            .run_with_timeout("sleep 10", Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(Error::CommandTimeout(_))));
    }

    #[tokio::test]
    async fn concurrent_commands_share_a_session() {
        let (server, dir) = trusted_server().await;
        let session = connect(&server, &dir).await;

        let (a, b) = tokio::join!(session.exec("echo one"), session.exec("echo two"));

        assert_eq!(a.unwrap().stdout_lossy(), "one\n");
        assert_eq!(b.unwrap().stdout_lossy(), "two\n");
    }
}
