use serde::{Deserialize, Serialize};

/// Wire protocol a service accepts. Stored as its numeric code in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LoadType {
    #[default]
    Http,
    Tcp,
    Grpc,
}

impl TryFrom<u8> for LoadType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(LoadType::Http),
            1 => Ok(LoadType::Tcp),
            2 => Ok(LoadType::Grpc),
            other => Err(format!("unknown load_type {}", other)),
        }
    }
}

impl From<LoadType> for u8 {
    fn from(v: LoadType) -> u8 {
        match v {
            LoadType::Http => 0,
            LoadType::Tcp => 1,
            LoadType::Grpc => 2,
        }
    }
}

/// How HTTP requests are matched to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RuleType {
    #[default]
    PrefixUrl,
    Domain,
}

impl TryFrom<u8> for RuleType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(RuleType::PrefixUrl),
            1 => Ok(RuleType::Domain),
            other => Err(format!("unknown rule_type {}", other)),
        }
    }
}

impl From<RuleType> for u8 {
    fn from(v: RuleType) -> u8 {
        match v {
            RuleType::PrefixUrl => 0,
            RuleType::Domain => 1,
        }
    }
}

/// Endpoint selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RoundType {
    Random,
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    IpHash,
}

impl TryFrom<u8> for RoundType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(RoundType::Random),
            1 => Ok(RoundType::RoundRobin),
            2 => Ok(RoundType::WeightedRoundRobin),
            3 => Ok(RoundType::IpHash),
            other => Err(format!("unknown round_type {}", other)),
        }
    }
}

impl From<RoundType> for u8 {
    fn from(v: RoundType) -> u8 {
        match v {
            RoundType::Random => 0,
            RoundType::RoundRobin => 1,
            RoundType::WeightedRoundRobin => 2,
            RoundType::IpHash => 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub load_type: LoadType,
    pub service_name: String,
    #[serde(default)]
    pub service_desc: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRule {
    #[serde(default)]
    pub rule_type: RuleType,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub need_strip_uri: u8,
    /// Comma-separated `"<regex> <replacement>"` entries applied to the path.
    #[serde(default)]
    pub url_rewrite: String,
    /// Comma-separated `"<op> <key> <value>"` entries, op in add/edit/del.
    #[serde(default)]
    pub header_transfor: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpRule {
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcRule {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub header_transfor: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControl {
    /// 1 enables whitelist/blacklist checks and mandatory app auth.
    #[serde(default)]
    pub open_auth: u8,
    #[serde(default)]
    pub black_list: String,
    #[serde(default)]
    pub white_list: String,
    #[serde(default)]
    pub client_ip_flow_limit: i64,
    #[serde(default)]
    pub service_flow_limit: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalance {
    #[serde(default)]
    pub round_type: RoundType,
    /// Comma-separated `host:port` endpoints.
    #[serde(default)]
    pub ip_list: String,
    /// Comma-separated integer weights, positionally matching `ip_list`.
    #[serde(default)]
    pub weight_list: String,
    #[serde(default)]
    pub forbid_list: String,
    /// Seconds; 0 means unbounded.
    #[serde(default)]
    pub upstream_connect_timeout: u64,
    #[serde(default)]
    pub upstream_header_timeout: u64,
    #[serde(default)]
    pub upstream_idle_timeout: u64,
    #[serde(default)]
    pub upstream_max_idle: usize,
}

/// Immutable snapshot of one published service. Built per reload, shared
/// behind an `Arc` for the duration of each request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDetail {
    pub info: ServiceInfo,
    #[serde(default)]
    pub http_rule: HttpRule,
    #[serde(default)]
    pub tcp_rule: TcpRule,
    #[serde(default)]
    pub grpc_rule: GrpcRule,
    #[serde(default)]
    pub access_control: AccessControl,
    #[serde(default)]
    pub load_balance: LoadBalance,
}

/// Tenant record. `app_id` doubles as the JWT issuer; `secret` signs it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct App {
    pub app_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub white_ips: String,
    #[serde(default)]
    pub qpd: i64,
    #[serde(default)]
    pub qps: i64,
}

/// Split a comma-separated config field, dropping empty entries.
pub fn csv_items(s: &str) -> Vec<&str> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}
