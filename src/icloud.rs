use std::{
    collections::HashMap,
    fs,
    io::{self, BufRead, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use reqwest::{
    StatusCode,
    blocking::{Client, Response},
    header::{COOKIE, SET_COOKIE},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::drive::{DriveClient, DriveError, DriveItem, DriveKind, DriveResult, RootInfo};

const SETUP_URL: &str = "https://setup.icloud.com/setup/ws/1";
const ROOT_DRIVEWSID: &str = "FOLDER::com.apple.CloudDocs::root";
const TRASH_DRIVEWSID: &str = "FOLDER::com.apple.CloudDocs::TRASH_ROOT";
const SESSION_FILE: &str = "session.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default, Serialize, Deserialize)]
struct Session {
    cookies: HashMap<String, String>,
    dsid: Option<String>,
    drive_url: Option<String>,
    doc_url: Option<String>,
}

/// Web-service adapter for the drive capability set. Owns the login
/// flow, the persisted cookie store and the 2FA prompt; the sync core
/// only ever sees the [`DriveClient`] trait.
pub struct WebDrive {
    http: Client,
    session: Mutex<Session>,
    session_path: PathBuf,
}

impl WebDrive {
    pub fn connect(username: &str, password: &str, cookie_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cookie_dir).with_context(|| {
            format!("failed to create cookie directory {}", cookie_dir.display())
        })?;

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let session_path = cookie_dir.join(SESSION_FILE);
        let session = load_session(&session_path);
        let drive = Self {
            http,
            session: Mutex::new(session),
            session_path,
        };

        drive.login(username, password)?;
        Ok(drive)
    }

    fn login(&self, username: &str, password: &str) -> Result<()> {
        let body = json!({
            "apple_id": username,
            "password": password,
            "extended_login": true,
        });
        let (status, payload) = self
            .post_value(&format!("{SETUP_URL}/accountLogin"), &body)
            .map_err(|err| anyhow!("login request failed: {err}"))?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            bail!("authentication rejected for {username}");
        }
        if !status.is_success() {
            bail!("login failed with HTTP {status}");
        }

        if payload
            .get("hsaChallengeRequired")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let code = prompt_verification_code()?;
            let verify = json!({ "securityCode": { "code": code } });
            let (verify_status, _) = self
                .post_value(&format!("{SETUP_URL}/validateVerificationCode"), &verify)
                .map_err(|err| anyhow!("2FA validation failed: {err}"))?;
            if !verify_status.is_success() {
                bail!("2FA code rejected (HTTP {verify_status})");
            }
            // Re-login with the trusted session cookies.
            let (status, _) = self
                .post_value(&format!("{SETUP_URL}/accountLogin"), &body)
                .map_err(|err| anyhow!("post-2FA login failed: {err}"))?;
            if !status.is_success() {
                bail!("post-2FA login failed with HTTP {status}");
            }
        }

        {
            let mut session = self.session.lock();
            session.dsid = payload
                .pointer("/dsInfo/dsid")
                .map(value_to_string)
                .or(session.dsid.take());
            session.drive_url = payload
                .pointer("/webservices/drivews/url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(session.drive_url.take());
            session.doc_url = payload
                .pointer("/webservices/docws/url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(session.doc_url.take());
        }
        self.persist_session();
        info!(username, "authenticated against iCloud");
        Ok(())
    }

    fn persist_session(&self) {
        let session = self.session.lock();
        if let Ok(data) = serde_json::to_vec_pretty(&*session) {
            if let Err(err) = fs::write(&self.session_path, data) {
                debug!(error = %err, "failed to persist session");
            }
        }
    }

    fn cookie_header(&self) -> String {
        let session = self.session.lock();
        session
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn absorb_cookies(&self, response: &Response) {
        let mut session = self.session.lock();
        for header in response.headers().get_all(SET_COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else {
                continue;
            };
            if let Some((name, value)) = pair.split_once('=') {
                session
                    .cookies
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    fn drive_endpoint(&self, operation: &str) -> DriveResult<String> {
        let session = self.session.lock();
        let base = session
            .drive_url
            .as_deref()
            .ok_or_else(|| DriveError::Auth("drive service URL unknown".to_string()))?;
        let dsid = session.dsid.as_deref().unwrap_or_default();
        Ok(format!("{base}/{operation}?dsid={dsid}"))
    }

    fn doc_endpoint(&self, operation: &str) -> DriveResult<String> {
        let session = self.session.lock();
        let base = session
            .doc_url
            .as_deref()
            .ok_or_else(|| DriveError::Auth("document service URL unknown".to_string()))?;
        let dsid = session.dsid.as_deref().unwrap_or_default();
        Ok(format!(
            "{base}/ws/com.apple.CloudDocs/{operation}?dsid={dsid}"
        ))
    }

    fn post_value(&self, url: &str, body: &Value) -> DriveResult<(StatusCode, Value)> {
        let response = self
            .http
            .post(url)
            .header(COOKIE, self.cookie_header())
            .header("Origin", "https://www.icloud.com")
            .json(body)
            .send()
            .map_err(request_error)?;
        self.absorb_cookies(&response);
        let status = response.status();
        if let Some(err) = status_error(status) {
            return Err(err);
        }
        let payload: Value = response.json().map_err(request_error)?;
        if payload
            .get("errorCode")
            .and_then(Value::as_str)
            .is_some_and(|code| code.contains("ZONE_BUSY"))
        {
            return Err(DriveError::ZoneBusy);
        }
        Ok((status, payload))
    }

    fn fetch_folder(&self, drivewsid: &str) -> DriveResult<Value> {
        let url = self.drive_endpoint("retrieveItemDetailsInFolders")?;
        let body = json!([{ "drivewsid": drivewsid, "partialData": false }]);
        let (_, payload) = self.post_value(&url, &body)?;
        payload
            .as_array()
            .and_then(|folders| folders.first())
            .cloned()
            .ok_or_else(|| DriveError::Other(format!("empty folder response for {drivewsid}")))
    }
}

fn load_session(path: &Path) -> Session {
    if let Ok(bytes) = fs::read(path) {
        if let Ok(session) = serde_json::from_slice::<Session>(&bytes) {
            return session;
        }
    }
    Session::default()
}

fn prompt_verification_code() -> Result<String> {
    eprint!("Two-factor authentication required. Enter the verification code: ");
    io::stderr().flush().ok();
    let mut code = String::new();
    io::stdin()
        .lock()
        .read_line(&mut code)
        .context("failed to read verification code")?;
    let code = code.trim().to_string();
    if code.is_empty() {
        bail!("empty verification code");
    }
    Ok(code)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn request_error(err: reqwest::Error) -> DriveError {
    if err.is_timeout() {
        DriveError::Timeout(err.to_string())
    } else {
        DriveError::Other(err.to_string())
    }
}

fn status_error(status: StatusCode) -> Option<DriveError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DriveError::Auth(format!("HTTP {status}"))
        }
        StatusCode::NOT_FOUND => DriveError::NotFound(format!("HTTP {status}")),
        StatusCode::CONFLICT | StatusCode::MISDIRECTED_REQUEST => DriveError::ZoneBusy,
        status if status.is_server_error() => DriveError::Service(format!("HTTP {status}")),
        status => DriveError::Other(format!("HTTP {status}")),
    })
}

fn item_from_json(item: &Value) -> Option<DriveItem> {
    let kind = match item.get("type").and_then(Value::as_str)? {
        "FILE" => DriveKind::File,
        "FOLDER" => DriveKind::Folder,
        "APP_LIBRARY" => DriveKind::AppLibrary,
        other => {
            debug!(kind = other, "skipping unknown remote item kind");
            return None;
        }
    };
    let name = match item.get("extension").and_then(Value::as_str) {
        Some(extension) => format!(
            "{}.{extension}",
            item.get("name").and_then(Value::as_str)?
        ),
        None => item.get("name").and_then(Value::as_str)?.to_string(),
    };
    Some(DriveItem {
        name,
        kind,
        size: item.get("size").and_then(Value::as_u64),
        mtime: item
            .get("dateModified")
            .and_then(Value::as_i64)
            .map(|millis| millis / 1000),
        handle: item.get("drivewsid").and_then(Value::as_str)?.to_string(),
        child_count: item.get("numberOfItems").and_then(Value::as_u64),
    })
}

impl DriveClient for WebDrive {
    fn list_root(&self) -> DriveResult<RootInfo> {
        let root = self.fetch_folder(ROOT_DRIVEWSID)?;
        let trash = self.fetch_folder(TRASH_DRIVEWSID)?;
        Ok(RootInfo {
            handle: ROOT_DRIVEWSID.to_string(),
            file_count: root.get("fileCount").and_then(Value::as_u64).unwrap_or(0),
            trash_count: trash
                .get("numberOfItems")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }

    fn list_folder(&self, handle: &str) -> DriveResult<Vec<DriveItem>> {
        let folder = self.fetch_folder(handle)?;
        let items = folder
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items.iter().filter_map(item_from_json).collect())
    }

    fn download(&self, handle: &str, dest: &Path) -> DriveResult<()> {
        let document_id = handle.rsplit("::").next().unwrap_or(handle);
        let url = format!(
            "{}&document_id={document_id}",
            self.doc_endpoint("download/by_id")?
        );
        let response = self
            .http
            .get(&url)
            .header(COOKIE, self.cookie_header())
            .send()
            .map_err(request_error)?;
        self.absorb_cookies(&response);
        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }
        let token: Value = response.json().map_err(request_error)?;
        let content_url = token
            .pointer("/data_token/url")
            .and_then(Value::as_str)
            .ok_or_else(|| DriveError::Other(format!("no download token for {handle}")))?;

        let mut content = self
            .http
            .get(content_url)
            .send()
            .map_err(request_error)?;
        if let Some(err) = status_error(content.status()) {
            return Err(err);
        }
        let mut file = fs::File::create(dest)
            .map_err(|err| DriveError::Other(format!("create {}: {err}", dest.display())))?;
        content
            .copy_to(&mut file)
            .map_err(|err| DriveError::Other(format!("write {}: {err}", dest.display())))?;
        Ok(())
    }

    fn upload(&self, parent: &str, name: &str, source: &Path, mtime: i64) -> DriveResult<String> {
        let bytes = fs::read(source)
            .map_err(|err| DriveError::Other(format!("read {}: {err}", source.display())))?;

        let url = self.doc_endpoint("upload/web")?;
        let body = json!({
            "filename": name,
            "type": "FILE",
            "content_type": "application/octet-stream",
            "size": bytes.len(),
        });
        let (_, ticket) = self.post_value(&url, &body)?;
        let upload_url = ticket
            .as_array()
            .and_then(|tickets| tickets.first())
            .and_then(|t| t.get("url"))
            .and_then(Value::as_str)
            .ok_or_else(|| DriveError::Other(format!("no upload ticket for {name}")))?
            .to_string();

        let response = self
            .http
            .post(&upload_url)
            .header(COOKIE, self.cookie_header())
            .body(bytes)
            .send()
            .map_err(request_error)?;
        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }
        let receipt: Value = response.json().map_err(request_error)?;
        let document_id = receipt
            .pointer("/singleFile/fileChecksum")
            .or_else(|| receipt.pointer("/singleFile/document_id"))
            .map(value_to_string)
            .ok_or_else(|| DriveError::Other(format!("no upload receipt for {name}")))?;

        let commit_url = self.doc_endpoint("update/documents")?;
        let commit = json!({
            "data": {
                "document_id": document_id,
                "parent_id": parent,
                "name": name,
                "mtime": mtime * 1000,
                "file_flags": { "is_writable": true, "is_executable": false, "is_hidden": false },
            },
            "allow_conflict": true,
        });
        let (_, committed) = self.post_value(&commit_url, &commit)?;
        let handle = committed
            .pointer("/results/0/document/item_id")
            .map(value_to_string)
            .unwrap_or(document_id);
        Ok(handle)
    }

    fn create_folder(&self, parent: &str, name: &str) -> DriveResult<String> {
        let url = self.drive_endpoint("createFolders")?;
        let body = json!({
            "destinationDrivewsId": parent,
            "folders": [{ "clientId": format!("FOLDER::{name}"), "name": name }],
        });
        let (_, payload) = self.post_value(&url, &body)?;
        payload
            .pointer("/folders/0/drivewsid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DriveError::Other(format!("folder {name} was not created")))
    }

    fn delete(&self, handle: &str) -> DriveResult<()> {
        let url = self.drive_endpoint("moveItemsToTrash")?;
        let body = json!({
            "items": [{ "drivewsid": handle, "etag": Value::Null, "clientId": handle }],
        });
        self.post_value(&url, &body)?;
        Ok(())
    }

    fn rename(&self, handle: &str, new_parent: &str, new_name: &str) -> DriveResult<()> {
        let move_url = self.drive_endpoint("moveItems")?;
        let body = json!({
            "destinationDrivewsId": new_parent,
            "items": [{ "drivewsid": handle, "etag": Value::Null, "clientId": handle }],
        });
        self.post_value(&move_url, &body)?;

        let rename_url = self.drive_endpoint("renameItems")?;
        let body = json!({
            "items": [{ "drivewsid": handle, "etag": Value::Null, "name": new_name }],
        });
        self.post_value(&rename_url, &body)?;
        Ok(())
    }
}
