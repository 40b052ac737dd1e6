//! The Purser facade.
//!
//! [`Purser`] aggregates the configuration planes, the device
//! identification caches, the transport and the response protocol behind
//! the public contract: registration, credentials refresh, repository URL
//! resolution and the related accessors.
//!
//! ## Error latch
//!
//! Operations return `Result` values, and additionally maintain the
//! latched single-error model the command line front-end polls: the first
//! error of a batch sets the latch and eagerly emits `done`; entry points
//! clear it. Both reporting paths carry the same error.
//!
//! ## Notifications
//!
//! State changes are broadcast through the injected [`Notifier`]; the
//! user state is always synced to disk before the matching notification
//! fires, so an observer that re-reads the plane sees the new value.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use crate::config::{self, ConfigStore, migration};
use crate::device::{self, HostPlatform, Platform};
use crate::protocol::{self, Response, ScopeCredentials};
use crate::repourl::{self, RepoContext};
use crate::transport::{self, ClientIdentity, TlsOptions};
use crate::{Error, Result};

/// Uids below this boundary are system accounts and never receive an
/// authorized_keys file.
const SYSTEM_UID_BOUNDARY: u32 = 1000;

/// Placeholder returned by [`Purser::credentials_scope`] when the
/// configuration carries no scope.
const BROKEN_SCOPE: &str = "your-configuration-is-broken-and-does-not-contain-credentials-scope";

/// Observer interface for state-change broadcasts.
///
/// All methods default to no-ops; implement the ones you care about.
pub trait Notifier {
    /// The device became registered or unregistered.
    fn on_registration_changed(&self) {}
    /// Per-scope credentials were refreshed.
    fn on_credentials_changed(&self) {}
    /// The selected flavour changed.
    fn on_flavour_changed(&self) {}
    /// A request batch completed (successfully or not).
    fn on_done(&self) {}
}

/// No-op [`Notifier`] for callers without an observer.
pub struct NullNotifier;

impl Notifier for NullNotifier {}

/// Locations of the four configuration planes.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub user: PathBuf,
    pub defaults: PathBuf,
    pub repos: PathBuf,
    pub board_map: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            user: config::USER_CONFIG_PATH.into(),
            defaults: config::DEFAULT_CONFIG_PATH.into(),
            repos: config::REPO_CONFIG_PATH.into(),
            board_map: config::BOARD_MAPPING_PATH.into(),
        }
    }
}

/// Device enrollment and repository URL resolution client.
pub struct Purser {
    settings: ConfigStore,
    repos: ConfigStore,
    board: ConfigStore,
    platform: Box<dyn Platform>,
    notifier: Box<dyn Notifier>,
    cpuinfo_path: PathBuf,
    model_cache: OnceCell<String>,
    family_cache: OnceCell<String>,
    error_flag: bool,
    error_string: String,
    pending_requests: usize,
    done_emitted: bool,
}

impl Purser {
    /// Open the system configuration planes.
    pub fn new() -> Result<Self> {
        Self::with_paths(ConfigPaths::default())
    }

    /// Open the given configuration planes with the host platform and no
    /// observer.
    pub fn with_paths(paths: ConfigPaths) -> Result<Self> {
        Self::with_parts(paths, Box::new(HostPlatform), Box::new(NullNotifier))
    }

    /// Fully injected constructor.
    ///
    /// Runs the schema migration against the vendor defaults and seeds
    /// the architecture before the first caller sees the store.
    pub fn with_parts(
        paths: ConfigPaths,
        platform: Box<dyn Platform>,
        notifier: Box<dyn Notifier>,
    ) -> Result<Self> {
        let mut settings = ConfigStore::open(paths.user)?;
        let defaults = ConfigStore::open(paths.defaults)?;
        migration::run(&mut settings, &defaults);
        migration::seed_arch(&mut settings);
        settings.sync()?;

        Ok(Self {
            settings,
            repos: ConfigStore::open(paths.repos)?,
            board: ConfigStore::open(paths.board_map)?,
            platform,
            notifier,
            cpuinfo_path: PathBuf::from(device::CPUINFO_PATH),
            model_cache: OnceCell::new(),
            family_cache: OnceCell::new(),
            error_flag: false,
            error_string: String::new(),
            pending_requests: 0,
            done_emitted: false,
        })
    }

    // ==================== Accessors ====================

    /// Whether the last operation latched an error.
    pub fn error(&self) -> bool {
        self.error_flag
    }

    /// The latched error message, empty when no error is latched.
    pub fn last_error(&self) -> &str {
        &self.error_string
    }

    /// Number of requests still pending in the current batch.
    pub fn pending_requests(&self) -> usize {
        self.pending_requests
    }

    /// The selected release for production or RND repositories.
    pub fn release(&self, rnd: bool) -> String {
        let key = if rnd { "rndRelease" } else { "release" };
        self.settings.get("", key).unwrap_or_default().to_string()
    }

    pub fn set_release(&mut self, release: &str, rnd: bool) -> Result<()> {
        let key = if rnd { "rndRelease" } else { "release" };
        self.settings.set("", key, release);
        self.settings.sync()
    }

    /// The selected flavour, defaulting to `release`.
    pub fn flavour(&self) -> String {
        self.settings
            .get("", "flavour")
            .unwrap_or("release")
            .to_string()
    }

    pub fn set_flavour(&mut self, flavour: &str) -> Result<()> {
        self.settings.set("", "flavour", flavour);
        self.settings.sync()?;
        self.notifier.on_flavour_changed();
        Ok(())
    }

    /// Whether peer verification is enabled (`ssl-verify`, default true).
    pub fn use_ssl_verify(&self) -> bool {
        self.settings.get_bool("", "ssl-verify").unwrap_or(true)
    }

    /// A device counts as registered only with both halves of the key
    /// pair present and the registered marker set.
    pub fn is_registered(&self) -> bool {
        self.settings.contains("", "privateKey")
            && self.settings.contains("", "certificate")
            && self.settings.get_bool("", "registered").unwrap_or(false)
    }

    /// Timestamp of the last successful credentials refresh.
    pub fn last_credentials_update(&self) -> Option<DateTime<Utc>> {
        self.settings.get_datetime("", "lastCredentialsUpdate")
    }

    /// Username and password stored for a credential scope.
    pub fn credentials(&self, scope: &str) -> (String, String) {
        let group = format!("credentials-{}", scope);
        (
            self.settings.get(&group, "username").unwrap_or_default().to_string(),
            self.settings.get(&group, "password").unwrap_or_default().to_string(),
        )
    }

    /// The credential scope used for repository access.
    ///
    /// The arguments are accepted for interface compatibility; the scope
    /// currently comes from the single `credentials-scope` key.
    pub fn credentials_scope(&self, _repo_name: &str, _rnd: bool) -> String {
        self.settings
            .get("", "credentials-scope")
            .unwrap_or(BROKEN_SCOPE)
            .to_string()
    }

    /// The credentials endpoint configured for a scope.
    pub fn credentials_url(&self, scope: &str) -> String {
        let key = format!("credentials-url-{}", scope);
        match self.settings.get("", &key) {
            Some(url) => url.to_string(),
            None => format!(
                "your-configuration-is-broken-and-does-not-contain-credentials-url-for-{}",
                scope
            ),
        }
    }

    // ==================== Device Identity ====================

    /// The discovered device model, cached for the facade lifetime.
    pub fn device_model(&self) -> String {
        self.model_cache
            .get_or_init(|| {
                device::probe_model(
                    &self.board,
                    self.settings.get("", "arch").unwrap_or_default(),
                    self.platform.as_ref(),
                    &self.cpuinfo_path,
                )
            })
            .clone()
    }

    /// The device family for the discovered model, cached likewise.
    pub fn device_family(&self) -> String {
        self.family_cache
            .get_or_init(|| device::family_for(&self.board, &self.device_model()))
            .clone()
    }

    /// The device UID, recomputed on demand.
    pub fn device_uid(&self) -> String {
        device::device_uid(&self.device_family(), self.platform.as_ref())
    }

    // ==================== Repository URLs ====================

    /// Resolve a repository name into a fully substituted URL.
    ///
    /// Returns the empty string when no template matches; callers detect
    /// the empty URL.
    pub fn repo_url(
        &mut self,
        repo_name: &str,
        rnd: bool,
        extra: HashMap<String, String>,
    ) -> String {
        self.error_flag = false;
        self.error_string.clear();

        let flavour = self.flavour();
        let model = self.device_model();
        let family = self.device_family();
        let ctx = RepoContext {
            settings: &self.settings,
            templates: &self.repos,
            flavour: &flavour,
            device_model: &model,
            device_family: &family,
        };
        repourl::resolve(&ctx, repo_name, rnd, extra)
    }

    // ==================== Registration ====================

    /// Register the device against the update service.
    ///
    /// Requires `ca-certificate` and `register-url` in the user state and
    /// a non-empty device UID. When `home-url` is configured, the user's
    /// authorized_keys material is fetched in the same batch.
    pub fn send_registration(&mut self, username: &str, password: &str) -> Result<()> {
        self.begin_operation();

        let ca_certificate = match self.require("ca-certificate") {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };
        let register_url = match self.require("register-url") {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };

        let uid = self.device_uid();
        if uid.is_empty() {
            return self.fail(Error::InvalidUid);
        }

        let options = TlsOptions {
            ca_certificate: ca_certificate.into(),
            verify: self.use_ssl_verify(),
            client_identity: None,
        };
        let agent = match transport::build_agent(&options) {
            Ok(agent) => agent,
            Err(e) => return self.fail(e),
        };

        let url = register_url.replace("%1", &uid);
        let device_model = self.device_model();

        // The whole batch is counted before the first dispatch so `done`
        // cannot fire between the two requests.
        let home_keys_url = self
            .settings
            .get("", "home-url")
            .map(|home| home.replace("%1", username))
            .filter(|home| !home.is_empty())
            .map(|home| format!("{}/authorized_keys", home.trim_end_matches('/')));
        self.pending_requests += 1;
        if home_keys_url.is_some() {
            self.pending_requests += 1;
        }

        let mut first_error = None;

        let outcome = transport::post_registration(&agent, &url, username, password, &device_model);
        if let Err(e) = self.handle_reply(&url, outcome) {
            first_error.get_or_insert(e);
        }

        if let Some(keys_url) = home_keys_url {
            let outcome = transport::get_body(&agent, &keys_url);
            if let Err(e) = self.handle_reply(&keys_url, outcome) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Refresh the per-scope credentials over mutual TLS.
    ///
    /// Without `force`, a refresh within 24 hours of the last one is
    /// skipped and `done` is emitted immediately.
    pub fn update_credentials(&mut self, force: bool) -> Result<()> {
        self.begin_operation();

        let uid = self.device_uid();
        if uid.is_empty() {
            return self.fail(Error::InvalidUid);
        }
        let ca_certificate = match self.require("ca-certificate") {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };
        let credentials_url = match self.require("credentials-url") {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };
        if !self.is_registered() {
            return self.fail(Error::NotRegistered);
        }

        if !force
            && let Some(last) = self.last_credentials_update()
            && last >= Utc::now() - Duration::days(1)
        {
            debug!("credentials are fresh, skipping update");
            self.emit_done();
            return Ok(());
        }

        let identity = ClientIdentity {
            certificate_pem: self
                .settings
                .get("", "certificate")
                .unwrap_or_default()
                .to_string(),
            private_key_pem: self
                .settings
                .get("", "privateKey")
                .unwrap_or_default()
                .to_string(),
        };
        let options = TlsOptions {
            ca_certificate: ca_certificate.into(),
            verify: self.use_ssl_verify(),
            client_identity: Some(identity),
        };
        let agent = match transport::build_agent(&options) {
            Ok(agent) => agent,
            Err(e) => return self.fail(e),
        };

        let url = credentials_url.replace("%1", &uid);
        self.pending_requests += 1;
        let outcome = transport::get_credentials(&agent, &url);
        self.handle_reply(&url, outcome)
    }

    /// Drop the registration locally. Does not contact the server.
    pub fn unregister(&mut self) -> Result<()> {
        self.settings.remove("", "privateKey");
        self.settings.remove("", "certificate");
        self.settings.set_bool("", "registered", false);
        self.settings.sync()?;
        self.notifier.on_registration_changed();
        Ok(())
    }

    // ==================== Reply Handling ====================

    fn handle_reply(&mut self, url: &str, outcome: Result<String>) -> Result<()> {
        // Anything under the home URL is raw key material, not protocol
        // traffic; download errors there are not interesting.
        if let Some(prefix) = self.home_url_prefix()
            && url.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase())
        {
            if let Ok(body) = outcome {
                self.store_authorized_keys(body.as_bytes());
            }
            self.finish_request();
            return Ok(());
        }

        let result = match outcome {
            Err(e) => Err(e),
            Ok(body) => {
                debug!("handling response from {}", url);
                match protocol::parse_response(&body) {
                    Ok(Response::Register {
                        certificate_pem,
                        private_key_pem,
                        user,
                    }) => self.apply_registration(certificate_pem, private_key_pem, user),
                    Ok(Response::Credentials(list)) => self.apply_credentials(list),
                    Err(e) => {
                        if matches!(e, Error::InvalidCertificate | Error::InvalidPrivateKey) {
                            // A failed provisioning must leave the device
                            // in the unregistered state.
                            self.settings.set_bool("", "registered", false);
                            if let Err(sync_err) = self.settings.sync() {
                                warn!("cannot persist unregistered state: {}", sync_err);
                            }
                        }
                        Err(e)
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                self.finish_request();
                Ok(())
            }
            Err(e) => {
                self.set_error(&e);
                self.finish_request();
                Err(e)
            }
        }
    }

    fn apply_registration(
        &mut self,
        certificate_pem: String,
        private_key_pem: String,
        user: Option<String>,
    ) -> Result<()> {
        self.settings.set("", "certificate", certificate_pem);
        self.settings.set("", "privateKey", private_key_pem);
        self.settings.set_bool("", "registered", true);
        if let Some(user) = user {
            debug!("device owner reported as {}", user);
        }
        self.settings.sync()?;
        self.notifier.on_registration_changed();
        Ok(())
    }

    fn apply_credentials(&mut self, credentials: Vec<ScopeCredentials>) -> Result<()> {
        let mut scopes = Vec::with_capacity(credentials.len());
        for entry in credentials {
            let group = format!("credentials-{}", entry.scope);
            self.settings.set(&group, "username", entry.username);
            self.settings.set(&group, "password", entry.password);
            scopes.push(entry.scope);
        }
        self.settings.set_list("", "credentialScopes", &scopes);
        self.settings
            .set_datetime("", "lastCredentialsUpdate", Utc::now());
        self.settings.sync()?;
        self.notifier.on_credentials_changed();
        Ok(())
    }

    fn home_url_prefix(&self) -> Option<String> {
        self.settings
            .get("", "home-url")
            .map(|home| home.replace("%1", ""))
            .map(|home| home.trim_end_matches('/').to_string())
            .filter(|home| !home.is_empty())
    }

    // ==================== Authorized Keys ====================

    /// Install SSH key material for the device owner.
    ///
    /// System accounts (uid below 1000) and users with an existing
    /// authorized_keys file are left alone.
    pub fn store_authorized_keys(&self, data: &[u8]) {
        if nix::unistd::geteuid().as_raw() < SYSTEM_UID_BOUNDARY {
            return;
        }
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        if let Err(e) = write_authorized_keys(Path::new(&home), data) {
            warn!("cannot store authorized keys: {}", e);
        }
    }

    // ==================== Error Latch ====================

    fn begin_operation(&mut self) {
        self.error_flag = false;
        self.error_string.clear();
        self.done_emitted = false;
    }

    fn set_error(&mut self, error: &Error) {
        if !self.error_flag {
            self.error_flag = true;
            self.error_string = error.to_string();
            debug_assert!(!self.error_string.is_empty());
        }
        // Eagerly unblock consumers waiting for the batch, even when
        // other requests remain pending.
        self.emit_done();
    }

    fn fail(&mut self, error: Error) -> Result<()> {
        self.set_error(&error);
        Err(error)
    }

    fn emit_done(&mut self) {
        if !self.done_emitted {
            self.done_emitted = true;
            self.notifier.on_done();
        }
    }

    fn finish_request(&mut self) {
        self.pending_requests = self.pending_requests.saturating_sub(1);
        if self.pending_requests == 0 {
            self.emit_done();
        }
    }

    fn require(&self, key: &'static str) -> Result<String> {
        self.settings
            .get("", key)
            .map(str::to_string)
            .ok_or(Error::MissingConfigKey(key))
    }
}

fn write_authorized_keys(home: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let ssh_dir = home.join(".ssh");
    let target = ssh_dir.join("authorized_keys");
    if target.exists() {
        return Ok(());
    }

    if !ssh_dir.exists() {
        fs::create_dir(&ssh_dir)?;
    }
    fs::set_permissions(&ssh_dir, fs::Permissions::from_mode(0o700))?;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&target)?;
    file.write_all(data)?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o600))?;
    Ok(())
}
