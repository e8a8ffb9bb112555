use std::collections::{BTreeMap, HashMap};
use std::process::Command as StdCommand;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use quick_xml::{events::Event as XmlEvent, Reader as XmlReader};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::driver::{
    AccountValidation, Driver, IpStatus, KeypairMaterial, TerminationOutcome,
};
use crate::error::DriverError;

type HmacSha256 = Hmac<Sha256>;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Static configuration for the EC2-backed driver, injected at startup.
#[derive(Clone)]
pub struct AwsDriverConfig {
    /// AWS region runners are launched in, e.g. "us-east-1".
    pub region: String,
}

// ── Base URL ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct BaseUrls {
    pub(crate) ec2: String,
}

impl BaseUrls {
    fn for_region(region: &str) -> Self {
        Self { ec2: format!("https://ec2.{}.amazonaws.com", region) }
    }
}

// ── Credentials ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

#[async_trait]
trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError>;
}

// ── Static credentials (env vars / config) ────────────────────────────────────

struct StaticCredentialsProvider {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError> {
        Ok(AwsCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone(),
        })
    }
}

// ── IMDS / ECS credentials ────────────────────────────────────────────────────

struct ImdsCredentialsProvider {
    client: reqwest::Client,
    ecs_uri: Option<String>,
    cache: tokio::sync::Mutex<Option<(AwsCredentials, Instant)>>,
}

#[async_trait]
impl CredentialsProvider for ImdsCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError> {
        {
            let guard = self.cache.lock().await;
            if let Some((creds, expiry)) = guard.as_ref() {
                if Instant::now() < *expiry {
                    return Ok(creds.clone());
                }
            }
        }

        let creds = if let Some(ref uri) = self.ecs_uri {
            let url = format!("http://169.254.170.2{}", uri);
            let resp: Value = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("ECS IMDS request: {}", e)))?
                .json()
                .await
                .map_err(|e| DriverError::Internal(format!("ECS IMDS decode: {}", e)))?;

            AwsCredentials {
                access_key_id: resp["AccessKeyId"].as_str().unwrap_or("").to_string(),
                secret_access_key: resp["SecretAccessKey"].as_str().unwrap_or("").to_string(),
                session_token: resp["Token"].as_str().map(str::to_string),
            }
        } else {
            let token_resp = self
                .client
                .put("http://169.254.169.254/latest/api/token")
                .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDSv2 token request: {}", e)))?;
            let imds_token = token_resp
                .text()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDSv2 token decode: {}", e)))?;

            let roles_resp = self
                .client
                .get("http://169.254.169.254/latest/meta-data/iam/security-credentials/")
                .header("X-aws-ec2-metadata-token", &imds_token)
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDS roles request: {}", e)))?;
            let roles_text = roles_resp.text().await.unwrap_or_default();
            let role_name = roles_text.lines().next().unwrap_or("").to_string();
            if role_name.is_empty() {
                return Err(DriverError::Internal("IMDS: no IAM role found".into()));
            }

            let creds_url = format!(
                "http://169.254.169.254/latest/meta-data/iam/security-credentials/{}",
                role_name
            );
            let resp: Value = self
                .client
                .get(&creds_url)
                .header("X-aws-ec2-metadata-token", &imds_token)
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDS creds request: {}", e)))?
                .json()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDS creds decode: {}", e)))?;

            AwsCredentials {
                access_key_id: resp["AccessKeyId"].as_str().unwrap_or("").to_string(),
                secret_access_key: resp["SecretAccessKey"].as_str().unwrap_or("").to_string(),
                session_token: resp["Token"].as_str().map(str::to_string),
            }
        };

        let expiry = Instant::now() + Duration::from_secs(600);
        *self.cache.lock().await = Some((creds.clone(), expiry));
        Ok(creds)
    }
}

// ── AWS CLI credentials ───────────────────────────────────────────────────────

struct AwsCliCredentialsProvider;

#[async_trait]
impl CredentialsProvider for AwsCliCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError> {
        let output = StdCommand::new("aws")
            .args(["sts", "get-session-token", "--duration-seconds", "3600", "--output", "json"])
            .output()
            .map_err(|e| {
                DriverError::Internal(format!(
                    "aws CLI not found: {}. Install AWS CLI or configure credentials via env vars.",
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::Internal(format!(
                "aws sts get-session-token failed: {}. Run 'aws configure' first.",
                stderr.trim()
            )));
        }

        let resp: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| DriverError::Internal(format!("aws CLI output parse: {}", e)))?;

        let creds = &resp["Credentials"];
        Ok(AwsCredentials {
            access_key_id: creds["AccessKeyId"].as_str().unwrap_or("").to_string(),
            secret_access_key: creds["SecretAccessKey"].as_str().unwrap_or("").to_string(),
            session_token: creds["SessionToken"].as_str().map(str::to_string),
        })
    }
}

#[cfg(test)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

#[cfg(test)]
#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError> {
        Ok(AwsCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone(),
        })
    }
}

// ── SigV4 signing ─────────────────────────────────────────────────────────────

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn url_host(url: &str) -> &str {
    let without_scheme = url.trim_start_matches("https://").trim_start_matches("http://");
    match without_scheme.find('/') {
        Some(pos) => &without_scheme[..pos],
        None => without_scheme,
    }
}

fn sigv4_headers(
    method: &str,
    uri_path: &str,
    query_string: &str,
    content_type: &str,
    body: &[u8],
    creds: &AwsCredentials,
    region: &str,
    service: &str,
    host: &str,
) -> BTreeMap<String, String> {
    let now = chrono::Utc::now();
    let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let payload_hash = sha256_hex(body);

    let mut canon_hdrs: BTreeMap<String, String> = BTreeMap::new();
    canon_hdrs.insert("content-type".into(), content_type.into());
    canon_hdrs.insert("host".into(), host.into());
    canon_hdrs.insert("x-amz-content-sha256".into(), payload_hash.clone());
    canon_hdrs.insert("x-amz-date".into(), timestamp.clone());
    if let Some(ref token) = creds.session_token {
        canon_hdrs.insert("x-amz-security-token".into(), token.clone());
    }

    let signed_headers: String = canon_hdrs.keys().cloned().collect::<Vec<_>>().join(";");
    let canonical_headers: String = canon_hdrs
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, uri_path, query_string, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        timestamp,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date, region, service);
    let signature = hmac_sha256(&signing_key, string_to_sign.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();

    let auth = format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        creds.access_key_id, scope, signed_headers, signature
    );

    let mut out = BTreeMap::new();
    out.insert("Authorization".into(), auth);
    out.insert("x-amz-date".into(), timestamp);
    out.insert("x-amz-content-sha256".into(), payload_hash);
    if let Some(ref token) = creds.session_token {
        out.insert("x-amz-security-token".into(), token.clone());
    }
    out
}

// ── XML helpers ───────────────────────────────────────────────────────────────

fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let tag_bytes = tag.as_bytes();
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_tag = false;
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                if !in_tag && e.local_name().as_ref() == tag_bytes {
                    in_tag = true;
                    depth = 0;
                } else if in_tag {
                    depth += 1;
                }
            }
            Ok(XmlEvent::End(_)) => {
                if in_tag {
                    if depth == 0 {
                        return None;
                    }
                    depth -= 1;
                }
            }
            Ok(XmlEvent::Text(e)) if in_tag && depth == 0 => {
                return e.unescape().ok().map(|s| s.into_owned());
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    None
}

fn xml_all_texts(xml: &str, tag: &str) -> Vec<String> {
    let tag_bytes = tag.as_bytes();
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut result = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                if depth == 0 && e.local_name().as_ref() == tag_bytes {
                    depth = 1;
                } else if depth > 0 {
                    depth += 1;
                }
            }
            Ok(XmlEvent::End(_)) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Ok(XmlEvent::Text(e)) if depth == 1 => {
                if let Ok(s) = e.unescape() {
                    result.push(s.into_owned());
                }
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    result
}

fn xml_error_code(xml: &str) -> String {
    xml_text(xml, "Code").or_else(|| xml_text(xml, "code")).unwrap_or_else(|| "Unknown".into())
}

fn xml_error_message(xml: &str) -> String {
    xml_text(xml, "Message")
        .or_else(|| xml_text(xml, "message"))
        .unwrap_or_else(|| "unknown error".into())
}

// ── AwsDriver ─────────────────────────────────────────────────────────────────

/// EC2-backed [`Driver`]. Talks the EC2 Query API directly over SigV4-signed
/// HTTP rather than through a generated SDK, mirroring how this workspace
/// already signs its own AWS calls elsewhere.
pub struct AwsDriver {
    config: AwsDriverConfig,
    client: reqwest::Client,
    creds: Box<dyn CredentialsProvider>,
    base: BaseUrls,
}

impl AwsDriver {
    /// Resolve credentials in priority order: static env vars, ECS task
    /// metadata, EC2 IMDSv2, then the `aws` CLI as a last resort.
    pub async fn new(config: AwsDriverConfig) -> Result<Self, DriverError> {
        let client = reqwest::Client::new();
        let base = BaseUrls::for_region(&config.region);

        let creds: Box<dyn CredentialsProvider> = if let (Ok(key), Ok(secret)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            Box::new(StaticCredentialsProvider {
                access_key_id: key,
                secret_access_key: secret,
                session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            })
        } else if let Ok(uri) = std::env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
            Box::new(ImdsCredentialsProvider {
                client: client.clone(),
                ecs_uri: Some(uri),
                cache: tokio::sync::Mutex::new(None),
            })
        } else {
            let imds_probe = client
                .get("http://169.254.169.254/latest/api/token")
                .header("X-aws-ec2-metadata-token-ttl-seconds", "10")
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            if imds_probe.is_ok() {
                Box::new(ImdsCredentialsProvider {
                    client: client.clone(),
                    ecs_uri: None,
                    cache: tokio::sync::Mutex::new(None),
                })
            } else {
                Box::new(AwsCliCredentialsProvider)
            }
        };

        Ok(Self { config, client, creds, base })
    }

    #[cfg(test)]
    pub(crate) fn with_test_config(
        config: AwsDriverConfig,
        base: BaseUrls,
        creds: impl CredentialsProvider + 'static,
    ) -> Self {
        Self { config, client: reqwest::Client::new(), creds: Box::new(creds), base }
    }

    async fn get_creds(&self) -> Result<AwsCredentials, DriverError> {
        self.creds.credentials().await
    }

    /// POST an EC2 Query-protocol request (`Action=...&Param=...`), returning
    /// the raw XML response body.
    async fn ec2_query(&self, params: &[(&str, &str)]) -> Result<String, DriverError> {
        let creds = self.get_creds().await?;
        let host = url_host(&self.base.ec2).to_string();
        let url = format!("{}/", self.base.ec2.trim_end_matches('/'));

        let body_str = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let body_bytes = body_str.as_bytes();

        let ct = "application/x-www-form-urlencoded; charset=utf-8";
        let sig_headers =
            sigv4_headers("POST", "/", "", ct, body_bytes, &creds, &self.config.region, "ec2", &host);

        let mut req = self.client.post(&url).header("Content-Type", ct).body(body_bytes.to_vec());
        for (k, v) in &sig_headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DriverError::Transient(format!("POST {} failed: {}", url, e)))?;

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();

        if status == 401 || status == 403 {
            return Err(DriverError::Auth(format!("{}: {}", xml_error_code(&text), xml_error_message(&text))));
        }
        if status >= 500 || status == 503 {
            return Err(DriverError::Transient(format!("{}: {}", xml_error_code(&text), xml_error_message(&text))));
        }
        if status >= 400 {
            return Err(DriverError::OperationFailed(format!(
                "{}: {}",
                xml_error_code(&text),
                xml_error_message(&text)
            )));
        }
        Ok(text)
    }
}

#[async_trait]
impl Driver for AwsDriver {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn create_keypair(&self, key_name: &str) -> Result<KeypairMaterial, DriverError> {
        debug!(key_name, "ec2: CreateKeyPair");
        let xml = self
            .ec2_query(&[("Action", "CreateKeyPair"), ("Version", "2016-11-15"), ("KeyName", key_name)])
            .await?;
        let cloud_key_id = xml_text(&xml, "keyFingerprint").unwrap_or_default();
        let private_key_pem = xml_text(&xml, "keyMaterial")
            .ok_or_else(|| DriverError::OperationFailed("CreateKeyPair: no keyMaterial in response".into()))?;
        Ok(KeypairMaterial { cloud_key_id, key_name: key_name.to_string(), private_key_pem })
    }

    async fn delete_keypair(&self, _cloud_key_id: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn create_instance(
        &self,
        key_name: &str,
        image_identifier: &str,
        machine_identifier: &str,
        security_group_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> Result<String, DriverError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("Action", "RunInstances"),
            ("Version", "2016-11-15"),
            ("ImageId", image_identifier),
            ("InstanceType", machine_identifier),
            ("KeyName", key_name),
            ("MinCount", "1"),
            ("MaxCount", "1"),
        ];
        let sg_keys: Vec<String> = (1..=security_group_ids.len())
            .map(|i| format!("SecurityGroupId.{}", i))
            .collect();
        for (k, v) in sg_keys.iter().zip(security_group_ids.iter()) {
            params.push((k.as_str(), v.as_str()));
        }
        let xml = self.ec2_query(&params).await?;
        let instance_id = xml_text(&xml, "instanceId")
            .ok_or_else(|| DriverError::OperationFailed("RunInstances: no instanceId in response".into()))?;

        if !tags.is_empty() {
            self.tag_resource(&instance_id, tags).await?;
        }
        Ok(instance_id)
    }

    async fn wait_running(&self, instance_id: &str) -> Result<(), DriverError> {
        for _ in 0..60 {
            let xml = self
                .ec2_query(&[
                    ("Action", "DescribeInstances"),
                    ("Version", "2016-11-15"),
                    ("InstanceId.1", instance_id),
                ])
                .await?;
            if xml_text(&xml, "name").as_deref() == Some("running") {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(DriverError::Transient(format!("instance {} never reached running", instance_id)))
    }

    async fn describe_ip(&self, instance_id: &str) -> Result<IpStatus, DriverError> {
        let xml = self
            .ec2_query(&[
                ("Action", "DescribeInstances"),
                ("Version", "2016-11-15"),
                ("InstanceId.1", instance_id),
            ])
            .await?;
        match xml_text(&xml, "ipAddress") {
            Some(ip) if !ip.is_empty() && ip != "Association" => Ok(IpStatus::Assigned(ip)),
            _ => Ok(IpStatus::Pending),
        }
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), DriverError> {
        self.ec2_query(&[
            ("Action", "StopInstances"),
            ("Version", "2016-11-15"),
            ("InstanceId.1", instance_id),
        ])
        .await?;
        Ok(())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), DriverError> {
        self.ec2_query(&[
            ("Action", "StartInstances"),
            ("Version", "2016-11-15"),
            ("InstanceId.1", instance_id),
        ])
        .await?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), DriverError> {
        self.ec2_query(&[
            ("Action", "TerminateInstances"),
            ("Version", "2016-11-15"),
            ("InstanceId.1", instance_id),
        ])
        .await?;
        Ok(())
    }

    async fn wait_terminated(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<TerminationOutcome, DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            let xml = self
                .ec2_query(&[
                    ("Action", "DescribeInstances"),
                    ("Version", "2016-11-15"),
                    ("InstanceId.1", instance_id),
                ])
                .await?;
            match xml_text(&xml, "name").as_deref() {
                Some("terminated") => return Ok(TerminationOutcome::Terminated),
                Some("stopping") if Instant::now() >= deadline => {
                    return Ok(TerminationOutcome::StillStopping)
                }
                _ if Instant::now() >= deadline => return Ok(TerminationOutcome::StillStopping),
                _ => tokio::time::sleep(Duration::from_secs(5)).await,
            }
        }
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> Result<String, DriverError> {
        let xml = self
            .ec2_query(&[
                ("Action", "CreateSecurityGroup"),
                ("Version", "2016-11-15"),
                ("GroupName", name),
                ("GroupDescription", description),
            ])
            .await?;
        xml_text(&xml, "groupId")
            .ok_or_else(|| DriverError::OperationFailed("CreateSecurityGroup: no groupId in response".into()))
    }

    async fn authorize_ingress(
        &self,
        cloud_group_id: &str,
        cidr: &str,
        port: u16,
    ) -> Result<(), DriverError> {
        let port_str = port.to_string();
        self.ec2_query(&[
            ("Action", "AuthorizeSecurityGroupIngress"),
            ("Version", "2016-11-15"),
            ("GroupId", cloud_group_id),
            ("IpPermissions.1.IpProtocol", "tcp"),
            ("IpPermissions.1.FromPort", &port_str),
            ("IpPermissions.1.ToPort", &port_str),
            ("IpPermissions.1.IpRanges.1.CidrIp", cidr),
        ])
        .await?;
        Ok(())
    }

    async fn delete_security_group(&self, cloud_group_id: &str) -> Result<(), DriverError> {
        self.ec2_query(&[
            ("Action", "DeleteSecurityGroup"),
            ("Version", "2016-11-15"),
            ("GroupId", cloud_group_id),
        ])
        .await?;
        Ok(())
    }

    async fn tag_resource(
        &self,
        resource_id: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), DriverError> {
        let mut params: Vec<(String, String)> = vec![
            ("Action".to_string(), "CreateTags".to_string()),
            ("Version".to_string(), "2016-11-15".to_string()),
            ("ResourceId.1".to_string(), resource_id.to_string()),
        ];
        for (i, (k, v)) in tags.iter().enumerate() {
            params.push((format!("Tag.{}.Key", i + 1), k.clone()));
            params.push((format!("Tag.{}.Value", i + 1), v.clone()));
        }
        let borrowed: Vec<(&str, &str)> =
            params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.ec2_query(&borrowed).await?;
        Ok(())
    }

    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String, DriverError> {
        let xml = self
            .ec2_query(&[
                ("Action", "CreateImage"),
                ("Version", "2016-11-15"),
                ("InstanceId", instance_id),
                ("Name", name),
            ])
            .await?;
        xml_text(&xml, "imageId")
            .ok_or_else(|| DriverError::OperationFailed("CreateImage: no imageId in response".into()))
    }

    async fn deregister_image(&self, image_id: &str) -> Result<(), DriverError> {
        self.ec2_query(&[
            ("Action", "DeregisterImage"),
            ("Version", "2016-11-15"),
            ("ImageId", image_id),
        ])
        .await?;
        Ok(())
    }

    async fn wait_image_available(
        &self,
        image_id: &str,
        retries: u32,
        delay: Duration,
    ) -> Result<(), DriverError> {
        for _ in 0..retries {
            let xml = self
                .ec2_query(&[
                    ("Action", "DescribeImages"),
                    ("Version", "2016-11-15"),
                    ("ImageId.1", image_id),
                ])
                .await?;
            if xml_text(&xml, "imageState").as_deref() == Some("available") {
                return Ok(());
            }
            tokio::time::sleep(delay).await;
        }
        Err(DriverError::Transient(format!("image {} not available after {} retries", image_id, retries)))
    }

    async fn validate_account(&self) -> Result<AccountValidation, DriverError> {
        match self.ec2_query(&[("Action", "DescribeAccountAttributes"), ("Version", "2016-11-15")]).await {
            Ok(_) => Ok(AccountValidation::Ok),
            Err(DriverError::Auth(_)) => Ok(AccountValidation::MissingPermissions(vec![
                "ec2:DescribeAccountAttributes".to_string(),
            ])),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigv4_signature_is_deterministic_for_fixed_clock_inputs() {
        let creds = AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        };
        let headers =
            sigv4_headers("POST", "/", "", "application/x-www-form-urlencoded", b"Action=Test", &creds, "us-east-1", "ec2", "ec2.us-east-1.amazonaws.com");
        assert!(headers.get("Authorization").unwrap().starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE"));
    }

    #[test]
    fn xml_text_extracts_first_matching_element() {
        let xml = "<DescribeInstancesResponse><instancesSet><item><instanceId>i-abc</instanceId></item></instancesSet></DescribeInstancesResponse>";
        assert_eq!(xml_text(xml, "instanceId"), Some("i-abc".to_string()));
    }

    #[test]
    fn xml_all_texts_collects_every_match() {
        let xml = "<r><item><groupId>sg-1</groupId></item><item><groupId>sg-2</groupId></item></r>";
        assert_eq!(xml_all_texts(xml, "groupId"), vec!["sg-1".to_string(), "sg-2".to_string()]);
    }

    #[test]
    fn xml_error_helpers_fall_back_when_absent() {
        assert_eq!(xml_error_code("<Response></Response>"), "Unknown");
        assert_eq!(xml_error_message("<Response></Response>"), "unknown error");
    }
}
