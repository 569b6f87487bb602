use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use url::Url;

use super::client::ResetType;

const SERVICE_ROOT: &str = "/redfish/v1/";
const SESSIONS: &str = "/redfish/v1/SessionService/Sessions";
const AUTH_HEADER: &str = "X-Auth-Token";

#[derive(Debug, thiserror::Error)]
pub enum RedfishError {
    #[error("BMC request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("BMC rejected the credentials ({0})")]
    Unauthorized(StatusCode),
    #[error("BMC returned {status} for {method} {path}: {body}")]
    Status {
        method: Method,
        path: String,
        status: StatusCode,
        body: String,
    },
    #[error("unexpected BMC response: {0}")]
    Unexpected(String),
}

impl RedfishError {
    pub fn is_unreachable(&self) -> bool {
        match self {
            RedfishError::Transport(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}

/// Vendor flavour of the Redfish service, probed from the service root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedfishDialect {
    Generic,
    HuaweiIbmc,
    DellIdrac,
    HpeIlo,
    Supermicro,
    LenovoXcc,
}

impl RedfishDialect {
    fn from_vendor(vendor: &str) -> Option<Self> {
        let vendor = vendor.trim().to_ascii_lowercase();
        if vendor.contains("huawei") || vendor.contains("xfusion") {
            Some(RedfishDialect::HuaweiIbmc)
        } else if vendor.contains("dell") {
            Some(RedfishDialect::DellIdrac)
        } else if vendor == "hpe" || vendor == "hp" || vendor.contains("hewlett") {
            Some(RedfishDialect::HpeIlo)
        } else if vendor.contains("supermicro") {
            Some(RedfishDialect::Supermicro)
        } else if vendor.contains("lenovo") {
            Some(RedfishDialect::LenovoXcc)
        } else {
            None
        }
    }

    pub fn detect(service_root: &JsonValue) -> Self {
        if let Some(dialect) = service_root
            .get("Vendor")
            .and_then(JsonValue::as_str)
            .and_then(Self::from_vendor)
        {
            return dialect;
        }
        service_root
            .get("Oem")
            .and_then(JsonValue::as_object)
            .and_then(|oem| oem.keys().find_map(|key| Self::from_vendor(key)))
            .unwrap_or(RedfishDialect::Generic)
    }

    /// Virtual media slot id the vendor uses for the CD drive.
    fn preferred_cd_slot(&self) -> &'static [&'static str] {
        match self {
            RedfishDialect::HpeIlo => &["2", "CD"],
            RedfishDialect::Supermicro => &["CD1", "CD"],
            RedfishDialect::LenovoXcc => &["EXT1", "CD"],
            _ => &["CD", "CD1", "Cd"],
        }
    }
}

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(rename = "Members", default)]
    members: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "@odata.id")]
    odata_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuInfo {
    pub architecture: String,
    pub model: Option<String>,
}

fn normalize_architecture(processor: &JsonValue) -> Option<String> {
    let instruction_set = processor
        .get("InstructionSet")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    match instruction_set.as_str() {
        "x86-64" => return Some("x86_64".to_string()),
        "arm-a64" => return Some("aarch64".to_string()),
        "arm-a32" => return Some("arm".to_string()),
        _ => {}
    }
    let architecture = processor
        .get("ProcessorArchitecture")
        .and_then(JsonValue::as_str)?
        .trim()
        .to_ascii_lowercase();
    let normalized = match architecture.as_str() {
        "x86" => "x86_64",
        "arm" => "aarch64",
        other => other,
    };
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.to_string())
    }
}

fn last_segment(odata_id: &str) -> String {
    odata_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// An authenticated Redfish session against one BMC.
pub struct RedfishSession {
    http: reqwest::Client,
    base: Url,
    token: String,
    session_uri: Option<String>,
    dialect: RedfishDialect,
}

impl RedfishSession {
    /// Probes the service root for the vendor dialect, then opens a session.
    pub async fn auto_detect(
        http: reqwest::Client,
        base: Url,
        username: &str,
        password: &str,
    ) -> Result<Self, RedfishError> {
        let root_url = base
            .join(SERVICE_ROOT)
            .map_err(|err| RedfishError::Unexpected(err.to_string()))?;
        let response = http.get(root_url).send().await?;
        if !response.status().is_success() {
            return Err(RedfishError::Status {
                method: Method::GET,
                path: SERVICE_ROOT.to_string(),
                status: response.status(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let service_root: JsonValue = response.json().await?;
        let dialect = RedfishDialect::detect(&service_root);

        let sessions_url = base
            .join(SESSIONS)
            .map_err(|err| RedfishError::Unexpected(err.to_string()))?;
        let response = http
            .post(sessions_url)
            .json(&serde_json::json!({ "UserName": username, "Password": password }))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RedfishError::Unauthorized(status));
        }
        if !status.is_success() {
            return Err(RedfishError::Status {
                method: Method::POST,
                path: SESSIONS.to_string(),
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        let token = response
            .headers()
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RedfishError::Unexpected("session response lacks X-Auth-Token".into()))?;
        let session_uri = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        tracing::debug!(base = %base, ?dialect, "Redfish session opened");
        Ok(Self {
            http,
            base,
            token,
            session_uri,
            dialect,
        })
    }

    pub fn dialect(&self) -> RedfishDialect {
        self.dialect
    }

    fn url(&self, path: &str) -> Result<Url, RedfishError> {
        self.base
            .join(path)
            .map_err(|err| RedfishError::Unexpected(format!("invalid path {path}: {err}")))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<Option<JsonValue>, RedfishError> {
        let mut request = self
            .http
            .request(method.clone(), self.url(path)?)
            .header(AUTH_HEADER, &self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RedfishError::Unauthorized(status));
        }
        if !status.is_success() {
            return Err(RedfishError::Status {
                method,
                path: path.to_string(),
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_slice(&bytes).ok())
    }

    async fn get(&self, path: &str) -> Result<JsonValue, RedfishError> {
        self.request(Method::GET, path, None)
            .await?
            .ok_or_else(|| RedfishError::Unexpected(format!("empty body for {path}")))
    }

    async fn members(&self, path: &str) -> Result<Vec<String>, RedfishError> {
        let collection: Collection = serde_json::from_value(self.get(path).await?)
            .map_err(|err| RedfishError::Unexpected(format!("{path}: {err}")))?;
        Ok(collection
            .members
            .into_iter()
            .map(|link| link.odata_id)
            .collect())
    }

    pub async fn default_system_id(&self) -> Result<String, RedfishError> {
        let systems = self.members("/redfish/v1/Systems").await?;
        systems
            .first()
            .map(|odata_id| last_segment(odata_id))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RedfishError::Unexpected("BMC reports no computer systems".into()))
    }

    /// SMBIOS UUID of the system, used to match the host once it boots the
    /// bootstrap image.
    pub async fn system_uuid(&self, system_id: &str) -> Result<Option<String>, RedfishError> {
        let system = self.get(&format!("/redfish/v1/Systems/{system_id}")).await?;
        Ok(system
            .get("UUID")
            .and_then(JsonValue::as_str)
            .map(|uuid| uuid.trim().to_ascii_lowercase())
            .filter(|uuid| !uuid.is_empty()))
    }

    pub async fn cpu_info(&self, system_id: &str) -> Result<Vec<CpuInfo>, RedfishError> {
        let path = format!("/redfish/v1/Systems/{system_id}/Processors");
        let mut cpus = Vec::new();
        for member in self.members(&path).await? {
            let processor = self.get(&member).await?;
            let is_cpu = processor
                .get("ProcessorType")
                .and_then(JsonValue::as_str)
                .map(|kind| kind.eq_ignore_ascii_case("CPU"))
                .unwrap_or(true);
            if !is_cpu {
                continue;
            }
            if let Some(architecture) = normalize_architecture(&processor) {
                cpus.push(CpuInfo {
                    architecture,
                    model: processor
                        .get("Model")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                });
            }
        }
        Ok(cpus)
    }

    pub async fn reset(&self, system_id: &str, reset: ResetType) -> Result<(), RedfishError> {
        let path = format!("/redfish/v1/Systems/{system_id}/Actions/ComputerSystem.Reset");
        self.request(
            Method::POST,
            &path,
            Some(serde_json::json!({ "ResetType": reset.as_redfish() })),
        )
        .await?;
        Ok(())
    }

    pub async fn boot_once_from_cd(&self, system_id: &str) -> Result<(), RedfishError> {
        let path = format!("/redfish/v1/Systems/{system_id}");
        self.request(
            Method::PATCH,
            &path,
            Some(serde_json::json!({
                "Boot": {
                    "BootSourceOverrideTarget": "Cd",
                    "BootSourceOverrideEnabled": "Once",
                }
            })),
        )
        .await?;
        Ok(())
    }

    async fn cd_slot(&self) -> Result<String, RedfishError> {
        let managers = self.members("/redfish/v1/Managers").await?;
        let manager = managers
            .first()
            .ok_or_else(|| RedfishError::Unexpected("BMC reports no managers".into()))?;
        let slots = self
            .members(&format!("{}/VirtualMedia", manager.trim_end_matches('/')))
            .await?;
        for preferred in self.dialect.preferred_cd_slot() {
            if let Some(slot) = slots.iter().find(|slot| last_segment(slot) == *preferred) {
                return Ok(slot.clone());
            }
        }
        slots
            .into_iter()
            .next()
            .ok_or_else(|| RedfishError::Unexpected("BMC exposes no virtual media".into()))
    }

    pub async fn insert_media(&self, image_url: &str) -> Result<(), RedfishError> {
        let slot = self.cd_slot().await?;
        let slot = slot.trim_end_matches('/');
        let (path, body) = match self.dialect {
            RedfishDialect::HuaweiIbmc => (
                format!("{slot}/Oem/Huawei/Actions/VirtualMedia.VmmControl"),
                serde_json::json!({ "VmmControlType": "Connect", "Image": image_url }),
            ),
            _ => (
                format!("{slot}/Actions/VirtualMedia.InsertMedia"),
                serde_json::json!({ "Image": image_url, "Inserted": true, "WriteProtected": true }),
            ),
        };
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    pub async fn eject_media(&self) -> Result<(), RedfishError> {
        let slot = self.cd_slot().await?;
        let slot = slot.trim_end_matches('/');
        let (path, body) = match self.dialect {
            RedfishDialect::HuaweiIbmc => (
                format!("{slot}/Oem/Huawei/Actions/VirtualMedia.VmmControl"),
                serde_json::json!({ "VmmControlType": "Disconnect" }),
            ),
            _ => (
                format!("{slot}/Actions/VirtualMedia.EjectMedia"),
                serde_json::json!({}),
            ),
        };
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    /// Deletes the session on the BMC. BMCs cap concurrent sessions, so
    /// leaking them locks operators out.
    pub async fn close(&self) -> Result<(), RedfishError> {
        let Some(uri) = self.session_uri.as_deref() else {
            return Ok(());
        };
        let path = match Url::parse(uri) {
            Ok(absolute) => absolute.path().to_string(),
            Err(_) => uri.to_string(),
        };
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }
}
