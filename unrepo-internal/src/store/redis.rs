use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use secrecy::{ExposeSecret, SecretString};

use crate::account::{Account, AccountStore, ExternalIdentity, Tier};
use crate::config::RedisConfig;
use crate::credential::{
    CreateOutcome, Credential, CredentialStore, NewCredential, ServiceClass,
};
use crate::error::{Error, ErrorDetails};
use crate::ledger::{UsageLedger, UsageRecord, UsageSummary, WindowAdmission};

const CREDENTIAL_KEY_PREFIX: &str = "unrepo:credential:";
const TOKEN_INDEX_KEY_PREFIX: &str = "unrepo:credential_token:";
const ACTIVE_INDEX_KEY_PREFIX: &str = "unrepo:credential_active:";
const ACCOUNT_KEY_PREFIX: &str = "unrepo:account:";
const LEDGER_KEY_PREFIX: &str = "unrepo:ledger:";

fn credential_key(credential_id: &str) -> String {
    format!("{CREDENTIAL_KEY_PREFIX}{credential_id}")
}

fn token_index_key(token_hash: &str) -> String {
    format!("{TOKEN_INDEX_KEY_PREFIX}{token_hash}")
}

fn active_index_key(account_id: &str, service_class: ServiceClass) -> String {
    format!("{ACTIVE_INDEX_KEY_PREFIX}{account_id}:{service_class}")
}

fn account_key(account_id: &str) -> String {
    format!("{ACCOUNT_KEY_PREFIX}{account_id}")
}

fn account_credentials_key(account_id: &str) -> String {
    format!("{ACCOUNT_KEY_PREFIX}{account_id}:credentials")
}

fn ledger_all_key(credential_id: &str) -> String {
    format!("{LEDGER_KEY_PREFIX}{credential_id}:all")
}

fn ledger_tier_key(credential_id: &str, tier: Tier) -> String {
    format!("{LEDGER_KEY_PREFIX}{credential_id}:{tier}")
}

fn ledger_records_key(credential_id: &str) -> String {
    format!("{LEDGER_KEY_PREFIX}{credential_id}:records")
}

// Returns the id of the active credential, creating one if none is usable.
const CREATE_CREDENTIAL_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
    local key = ARGV[2] .. existing
    local active = redis.call('HGET', key, 'is_active')
    local expires = redis.call('HGET', key, 'expires_at')
    if active == '1' and (not expires or expires == '' or tonumber(expires) > tonumber(ARGV[3])) then
        return existing
    end
end
redis.call('HSET', KEYS[2], unpack(ARGV, 4))
redis.call('SET', KEYS[3], ARGV[1])
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[1])
return ARGV[1]
"#;

// -2: no such credential, -1: cap reached, otherwise the new usage count.
const TRY_RECORD_USE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -2
end
local used = tonumber(redis.call('HGET', KEYS[1], 'usage_count') or '0')
if used >= tonumber(ARGV[1]) then
    return -1
end
local count = redis.call('HINCRBY', KEYS[1], 'usage_count', 1)
redis.call('HSET', KEYS[1], 'last_used_at', ARGV[2])
return count
"#;

const RECORD_USE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -2
end
local count = redis.call('HINCRBY', KEYS[1], 'usage_count', 1)
redis.call('HSET', KEYS[1], 'last_used_at', ARGV[1])
return count
"#;

const DEACTIVATE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'account_id') ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'is_active', '0')
if redis.call('GET', KEYS[2]) == ARGV[2] then
    redis.call('DEL', KEYS[2])
end
return 1
"#;

const SET_ACCOUNT_FIELDS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

const APPEND_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[2], ARGV[3])
return 1
"#;

// Returns {admitted, count_before, oldest_ms or -1}. Records are never removed.
const APPEND_WITHIN_WINDOW_SCRIPT: &str = r#"
local count = redis.call('ZCOUNT', KEYS[2], ARGV[4], '+inf')
local oldest = redis.call('ZRANGEBYSCORE', KEYS[2], ARGV[4], '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
local oldest_ms = -1
if oldest[2] then
    oldest_ms = tonumber(oldest[2])
end
if count >= tonumber(ARGV[5]) then
    return {0, count, oldest_ms}
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[2], ARGV[3])
return {1, count, oldest_ms}
"#;

struct Scripts {
    create_credential: Script,
    try_record_use: Script,
    record_use: Script,
    deactivate: Script,
    set_account_fields: Script,
    append: Script,
    append_within_window: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            create_credential: Script::new(CREATE_CREDENTIAL_SCRIPT),
            try_record_use: Script::new(TRY_RECORD_USE_SCRIPT),
            record_use: Script::new(RECORD_USE_SCRIPT),
            deactivate: Script::new(DEACTIVATE_SCRIPT),
            set_account_fields: Script::new(SET_ACCOUNT_FIELDS_SCRIPT),
            append: Script::new(APPEND_SCRIPT),
            append_within_window: Script::new(APPEND_WITHIN_WINDOW_SCRIPT),
        }
    }
}

/// Redis-backed store shared by every gateway replica.
///
/// Every conditional write is a single Lua script, so it is atomic across replicas.
/// Each call is bounded by `timeout_ms`; failures surface as errors, never as grants.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    timeout: Duration,
    scripts: Arc<Scripts>,
}

impl RedisStore {
    pub async fn connect(url: &SecretString, config: &RedisConfig) -> Result<Self, Error> {
        let client = redis::Client::open(url.expose_secret()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let timeout = Duration::from_millis(config.timeout_ms);
        let conn = tokio::time::timeout(
            timeout.max(Duration::from_secs(5)),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            Error::new(ErrorDetails::AppState {
                message: "Timed out connecting to Redis".to_string(),
            })
        })?
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to get Redis connection: {e}"),
            })
        })?;
        tracing::info!("Connected to Redis backing store");
        Ok(Self {
            conn,
            timeout,
            scripts: Arc::new(Scripts::new()),
        })
    }

    async fn run<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::new(ErrorDetails::Store {
                message: format!("`{operation}` failed: {e}"),
            })),
            Err(_) => Err(Error::new(ErrorDetails::StoreTimeout {
                operation: operation.to_string(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })),
        }
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        self.run("ping", redis::cmd("PING").query_async::<()>(&mut conn))
            .await
    }

    async fn read_credential(&self, credential_id: &str) -> Result<Option<Credential>, Error> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = self
            .run("get_credential", conn.hgetall(credential_key(credential_id)))
            .await?;
        credential_from_fields(&fields)
    }
}

fn serialization_error(message: impl Into<String>) -> Error {
    Error::new(ErrorDetails::Serialization {
        message: message.into(),
    })
}

fn opt_millis(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(String::new, |value| value.timestamp_millis().to_string())
}

fn parse_millis(value: &str) -> Result<Option<DateTime<Utc>>, Error> {
    if value.is_empty() {
        return Ok(None);
    }
    let millis: i64 = value
        .parse()
        .map_err(|e| serialization_error(format!("Invalid timestamp `{value}`: {e}")))?;
    DateTime::from_timestamp_millis(millis)
        .map(Some)
        .ok_or_else(|| serialization_error(format!("Timestamp out of range: {millis}")))
}

fn credential_fields(credential: &Credential) -> Vec<(&'static str, String)> {
    vec![
        ("id", credential.id.clone()),
        ("token", credential.token.clone()),
        ("account_id", credential.account_id.clone()),
        ("service_class", credential.service_class.to_string()),
        ("name", credential.name.clone()),
        ("is_active", if credential.is_active { "1" } else { "0" }.to_string()),
        ("usage_count", credential.usage_count.to_string()),
        ("last_used_at", opt_millis(credential.last_used_at)),
        ("created_at", credential.created_at.timestamp_millis().to_string()),
        ("expires_at", opt_millis(credential.expires_at)),
    ]
}

fn credential_from_fields(fields: &HashMap<String, String>) -> Result<Option<Credential>, Error> {
    if fields.is_empty() {
        return Ok(None);
    }
    let field = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| serialization_error(format!("Credential record missing `{name}`")))
    };
    let service_class = ServiceClass::from_str(field("service_class")?)
        .map_err(|e| serialization_error(format!("Invalid service class: {e}")))?;
    let usage_count = field("usage_count")?
        .parse()
        .map_err(|e| serialization_error(format!("Invalid usage count: {e}")))?;
    let created_at = parse_millis(field("created_at")?)?
        .ok_or_else(|| serialization_error("Credential record missing `created_at`"))?;
    Ok(Some(Credential {
        id: field("id")?.to_string(),
        token: field("token")?.to_string(),
        account_id: field("account_id")?.to_string(),
        service_class,
        name: field("name")?.to_string(),
        is_active: field("is_active")? == "1",
        usage_count,
        last_used_at: parse_millis(fields.get("last_used_at").map_or("", String::as_str))?,
        created_at,
        expires_at: parse_millis(fields.get("expires_at").map_or("", String::as_str))?,
    }))
}

fn bool_field(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn account_fields(account: &Account) -> Result<Vec<(&'static str, String)>, Error> {
    let identity = match &account.identity {
        Some(identity) => serde_json::to_string(identity)
            .map_err(|e| serialization_error(format!("Failed to serialize identity: {e}")))?,
        None => String::new(),
    };
    Ok(vec![
        ("id", account.id.clone()),
        ("identity", identity),
        ("payment_verified", bool_field(account.payment_verified)),
        ("is_token_holder", bool_field(account.is_token_holder)),
        ("token_balance", account.token_balance.to_string()),
    ])
}

fn account_from_fields(fields: &HashMap<String, String>) -> Result<Option<Account>, Error> {
    let Some(id) = fields.get("id") else {
        return Ok(None);
    };
    let identity = match fields.get("identity").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(
            serde_json::from_str::<ExternalIdentity>(raw)
                .map_err(|e| serialization_error(format!("Invalid identity: {e}")))?,
        ),
    };
    let flag = |name: &str| fields.get(name).is_some_and(|value| value == "1");
    let token_balance = match fields.get("token_balance") {
        Some(raw) => raw
            .parse()
            .map_err(|e| serialization_error(format!("Invalid token balance: {e}")))?,
        None => 0.0,
    };
    Ok(Some(Account {
        id: id.clone(),
        identity,
        payment_verified: flag("payment_verified"),
        is_token_holder: flag("is_token_holder"),
        token_balance,
    }))
}

fn record_json(record: &UsageRecord) -> Result<String, Error> {
    serde_json::to_string(record)
        .map_err(|e| serialization_error(format!("Failed to serialize usage record: {e}")))
}

#[async_trait]
impl CredentialStore for RedisStore {
    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Credential>, Error> {
        let mut conn = self.conn.clone();
        let id: Option<String> = self
            .run("find_credential", conn.get(token_index_key(token_hash)))
            .await?;
        match id {
            Some(id) => self.read_credential(&id).await,
            None => Ok(None),
        }
    }

    async fn get(&self, credential_id: &str) -> Result<Option<Credential>, Error> {
        self.read_credential(credential_id).await
    }

    async fn create(&self, new: NewCredential, now: DateTime<Utc>) -> Result<CreateOutcome, Error> {
        let active_key = active_index_key(&new.account_id, new.service_class);
        let credentials_key = account_credentials_key(&new.account_id);
        let candidate = new.into_credential(now);

        let mut invocation = self.scripts.create_credential.key(&active_key);
        invocation
            .key(credential_key(&candidate.id))
            .key(token_index_key(&candidate.token_hash()))
            .key(&credentials_key)
            .arg(&candidate.id)
            .arg(CREDENTIAL_KEY_PREFIX)
            .arg(now.timestamp_millis());
        for (name, value) in credential_fields(&candidate) {
            invocation.arg(name).arg(value);
        }

        let mut conn = self.conn.clone();
        let id: String = self
            .run("create_credential", invocation.invoke_async(&mut conn))
            .await?;
        if id == candidate.id {
            return Ok(CreateOutcome::Created(candidate));
        }
        match self.read_credential(&id).await? {
            Some(existing) => Ok(CreateOutcome::Existing(existing)),
            None => Err(Error::new(ErrorDetails::Store {
                message: format!("Active index points at missing credential `{id}`"),
            })),
        }
    }

    async fn record_use(&self, credential_id: &str, now: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .run(
                "record_use",
                self.scripts
                    .record_use
                    .key(credential_key(credential_id))
                    .arg(now.timestamp_millis())
                    .invoke_async(&mut conn),
            )
            .await?;
        u64::try_from(count).map_err(|_| {
            Error::new(ErrorDetails::CredentialNotFound {
                credential_id: credential_id.to_string(),
            })
        })
    }

    async fn try_record_use(
        &self,
        credential_id: &str,
        cap: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, Error> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .run(
                "try_record_use",
                self.scripts
                    .try_record_use
                    .key(credential_key(credential_id))
                    .arg(cap)
                    .arg(now.timestamp_millis())
                    .invoke_async(&mut conn),
            )
            .await?;
        match count {
            -2 => Err(Error::new(ErrorDetails::CredentialNotFound {
                credential_id: credential_id.to_string(),
            })),
            -1 => Ok(None),
            count => Ok(u64::try_from(count).ok()),
        }
    }

    async fn deactivate(&self, credential_id: &str, account_id: &str) -> Result<bool, Error> {
        let Some(credential) = self.read_credential(credential_id).await? else {
            return Ok(false);
        };
        if credential.account_id != account_id {
            return Ok(false);
        }
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .run(
                "deactivate",
                self.scripts
                    .deactivate
                    .key(credential_key(credential_id))
                    .key(active_index_key(account_id, credential.service_class))
                    .arg(account_id)
                    .arg(credential_id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn list_for_account(&self, account_id: &str) -> Result<Vec<Credential>, Error> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .run(
                "list_credentials",
                conn.smembers(account_credentials_key(account_id)),
            )
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(credential_key(id));
        }
        let rows: Vec<HashMap<String, String>> = self
            .run("list_credentials", pipe.query_async(&mut conn))
            .await?;
        let mut credentials = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(credential) = credential_from_fields(row)? {
                credentials.push(credential);
            }
        }
        credentials.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(credentials)
    }
}

#[async_trait]
impl AccountStore for RedisStore {
    async fn get(&self, account_id: &str) -> Result<Option<Account>, Error> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = self
            .run("get_account", conn.hgetall(account_key(account_id)))
            .await?;
        account_from_fields(&fields)
    }

    async fn upsert(&self, account: Account) -> Result<(), Error> {
        let fields = account_fields(&account)?;
        let mut conn = self.conn.clone();
        self.run(
            "upsert_account",
            conn.hset_multiple::<_, _, _, ()>(account_key(&account.id), &fields[..]),
        )
        .await
    }

    async fn set_payment_verified(&self, account_id: &str, verified: bool) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .run(
                "set_payment_verified",
                self.scripts
                    .set_account_fields
                    .key(account_key(account_id))
                    .arg("payment_verified")
                    .arg(bool_field(verified))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn set_token_holder(
        &self,
        account_id: &str,
        is_holder: bool,
        balance: Option<f64>,
    ) -> Result<bool, Error> {
        let mut invocation = self.scripts.set_account_fields.key(account_key(account_id));
        invocation.arg("is_token_holder").arg(bool_field(is_holder));
        if let Some(balance) = balance {
            invocation.arg("token_balance").arg(balance.to_string());
        }
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .run("set_token_holder", invocation.invoke_async(&mut conn))
            .await?;
        Ok(updated == 1)
    }
}

#[async_trait]
impl UsageLedger for RedisStore {
    async fn append(&self, record: UsageRecord) -> Result<(), Error> {
        let json = record_json(&record)?;
        let mut conn = self.conn.clone();
        self.run(
            "append_usage",
            self.scripts
                .append
                .key(ledger_all_key(&record.credential_id))
                .key(ledger_tier_key(&record.credential_id, record.tier))
                .key(ledger_records_key(&record.credential_id))
                .arg(record.timestamp.timestamp_millis())
                .arg(record.id.to_string())
                .arg(json)
                .invoke_async::<i64>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn count_since(
        &self,
        credential_id: &str,
        since: DateTime<Utc>,
        tier: Option<Tier>,
    ) -> Result<u64, Error> {
        let key = match tier {
            Some(tier) => ledger_tier_key(credential_id, tier),
            None => ledger_all_key(credential_id),
        };
        let mut conn = self.conn.clone();
        self.run(
            "count_usage",
            conn.zcount(key, since.timestamp_millis(), "+inf"),
        )
        .await
    }

    async fn append_within_window(
        &self,
        record: UsageRecord,
        since: DateTime<Utc>,
        cap: u64,
    ) -> Result<WindowAdmission, Error> {
        let json = record_json(&record)?;
        let mut conn = self.conn.clone();
        let result: Vec<i64> = self
            .run(
                "append_usage_within_window",
                self.scripts
                    .append_within_window
                    .key(ledger_all_key(&record.credential_id))
                    .key(ledger_tier_key(&record.credential_id, record.tier))
                    .key(ledger_records_key(&record.credential_id))
                    .arg(record.timestamp.timestamp_millis())
                    .arg(record.id.to_string())
                    .arg(json)
                    .arg(since.timestamp_millis())
                    .arg(cap)
                    .invoke_async(&mut conn),
            )
            .await?;
        let [admitted, count, oldest_ms] = result[..] else {
            return Err(serialization_error(format!(
                "Unexpected window script result: {result:?}"
            )));
        };
        let count = u64::try_from(count).unwrap_or(0);
        let oldest = if oldest_ms < 0 {
            None
        } else {
            DateTime::from_timestamp_millis(oldest_ms)
        };
        if admitted == 1 {
            Ok(WindowAdmission::Admitted {
                count_before: count,
                oldest: oldest.map_or(record.timestamp, |oldest| oldest.min(record.timestamp)),
            })
        } else {
            Ok(WindowAdmission::Full { count, oldest })
        }
    }

    async fn summarize(
        &self,
        credential_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<UsageSummary, Error> {
        if credential_ids.is_empty() {
            return Ok(UsageSummary::default());
        }
        let mut pipe = redis::pipe();
        for credential_id in credential_ids {
            pipe.hvals(ledger_records_key(credential_id));
        }
        let mut conn = self.conn.clone();
        let rows: Vec<Vec<String>> = self
            .run("summarize_usage", pipe.query_async(&mut conn))
            .await?;
        let mut records = Vec::new();
        for raw in rows.iter().flatten() {
            let record: UsageRecord = serde_json::from_str(raw)
                .map_err(|e| serialization_error(format!("Invalid usage record: {e}")))?;
            records.push(record);
        }
        Ok(UsageSummary::from_records(&records, since))
    }
}
