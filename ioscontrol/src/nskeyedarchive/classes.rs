// Registered classes and the objects they decode to

use indexmap::IndexMap;
use tracing::debug;

use super::{ArchiveError, ArchiveValue, Archiver, Unarchiver};

/// Seconds between the unix epoch and 2001-01-01
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

const ATTACHMENT_LIFETIME_KEEP_ALWAYS: u64 = 0;
const ATTACHMENT_LIFETIME_DELETE_ALWAYS: u64 = 2;

type DecodeFn =
    fn(&str, &plist::Dictionary, &mut Unarchiver<'_>) -> Result<ArchiveValue, ArchiveError>;
type EncodeFn = fn(&ArchiveValue, &mut Archiver) -> Result<plist::Dictionary, ArchiveError>;

pub(crate) struct ClassFactory {
    pub name: &'static str,
    pub chain: &'static [&'static str],
    pub decode: DecodeFn,
    pub encode: EncodeFn,
}

macro_rules! class {
    ($name:literal, [$($parent:literal),*], $decode:expr, $encode:expr) => {
        ClassFactory {
            name: $name,
            chain: &[$name, $($parent),*],
            decode: $decode,
            encode: $encode,
        }
    };
}

static CLASSES: &[ClassFactory] = &[
    class!("NSNull", ["NSObject"], decode_null, encode_null),
    class!("NSString", ["NSObject"], decode_string, encode_string),
    class!("NSMutableString", ["NSString", "NSObject"], decode_string, encode_string),
    class!("NSData", ["NSObject"], decode_data, encode_data),
    class!("NSMutableData", ["NSData", "NSObject"], decode_data, encode_data),
    class!("NSArray", ["NSObject"], decode_array, encode_array),
    class!("NSMutableArray", ["NSArray", "NSObject"], decode_array, encode_array),
    class!("NSSet", ["NSObject"], decode_set, encode_array),
    class!("NSMutableSet", ["NSSet", "NSObject"], decode_set, encode_array),
    class!("NSDictionary", ["NSObject"], decode_dictionary, encode_dictionary),
    class!("NSMutableDictionary", ["NSDictionary", "NSObject"], decode_dictionary, encode_dictionary),
    class!("NSDate", ["NSObject"], decode_date, encode_date),
    class!("NSUUID", ["NSObject"], decode_uuid, encode_uuid),
    class!("NSError", ["NSObject"], decode_error, encode_error),
    class!("NSURL", ["NSObject"], decode_url, encode_url),
    class!("NSValue", ["NSObject"], decode_value, encode_value),
    class!("XCTCapabilities", ["NSObject"], decode_capabilities, encode_capabilities),
    class!("XCTTestIdentifier", ["NSObject"], decode_test_identifier, encode_test_identifier),
    class!("XCTTestIdentifierSet", ["NSObject"], decode_test_identifier_set, encode_test_identifier_set),
    class!("XCTestConfiguration", ["NSObject"], decode_test_configuration, encode_test_configuration),
    class!("XCActivityRecord", ["NSObject"], decode_activity_record, encode_activity_record),
    class!("XCTAttachment", ["NSObject"], decode_attachment, encode_attachment),
    class!("XCTIssue", ["NSObject"], decode_issue, encode_issue),
    class!("XCTMutableIssue", ["XCTIssue", "NSObject"], decode_issue, encode_issue),
    class!("XCTSourceCodeContext", ["NSObject"], decode_source_code_context, encode_source_code_context),
    class!("XCTSourceCodeLocation", ["NSObject"], decode_source_code_location, encode_source_code_location),
    class!("DTCPUClusterInfo", ["NSObject"], decode_cpu_cluster_info, encode_cpu_cluster_info),
    class!("DTTapMessage", ["NSObject"], decode_tap_message, encode_tap_message),
    class!("DTActivityTraceTapMessage", ["DTTapMessage", "NSObject"], decode_tap_message, encode_tap_message),
    class!("DTSysmonTapMessage", ["DTTapMessage", "NSObject"], decode_tap_message, encode_tap_message),
    class!("DTKTraceTapMessage", ["DTTapMessage", "NSObject"], decode_tap_message, encode_tap_message),
    class!("DTTapHeartbeatMessage", ["DTTapMessage", "NSObject"], decode_tap_message, encode_tap_message),
    class!("DTTapStatusMessage", ["DTTapMessage", "NSObject"], decode_tap_message, encode_tap_message),
];

pub(crate) fn lookup(name: &str) -> Option<&'static ClassFactory> {
    CLASSES.iter().find(|c| c.name == name)
}

/// Objects of registered classes that are not plain collections
#[derive(Debug, Clone, PartialEq)]
pub enum NsObject {
    Date(NsDate),
    Uuid(uuid::Uuid),
    Error(NsError),
    Url(NsUrl),
    Value(NsValue),
    Capabilities(XctCapabilities),
    TestIdentifier(XctTestIdentifier),
    TestIdentifierSet(Vec<XctTestIdentifier>),
    TestConfiguration(XcTestConfiguration),
    ActivityRecord(XcActivityRecord),
    Attachment(XctAttachment),
    Issue(XctIssue),
    SourceCodeContext(XctSourceCodeContext),
    SourceCodeLocation(XctSourceCodeLocation),
    CpuClusterInfo(DtCpuClusterInfo),
    TapMessage(DtTapMessage),
}

impl NsObject {
    pub fn class_name(&self) -> &'static str {
        match self {
            NsObject::Date(_) => "NSDate",
            NsObject::Uuid(_) => "NSUUID",
            NsObject::Error(_) => "NSError",
            NsObject::Url(_) => "NSURL",
            NsObject::Value(_) => "NSValue",
            NsObject::Capabilities(_) => "XCTCapabilities",
            NsObject::TestIdentifier(_) => "XCTTestIdentifier",
            NsObject::TestIdentifierSet(_) => "XCTTestIdentifierSet",
            NsObject::TestConfiguration(_) => "XCTestConfiguration",
            NsObject::ActivityRecord(_) => "XCActivityRecord",
            NsObject::Attachment(_) => "XCTAttachment",
            NsObject::Issue(i) if i.mutable => "XCTMutableIssue",
            NsObject::Issue(_) => "XCTIssue",
            NsObject::SourceCodeContext(_) => "XCTSourceCodeContext",
            NsObject::SourceCodeLocation(_) => "XCTSourceCodeLocation",
            NsObject::CpuClusterInfo(_) => "DTCPUClusterInfo",
            NsObject::TapMessage(t) => t.kind.class_name(),
        }
    }
}

/// `NSDate`, seconds since 2001-01-01 UTC
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NsDate {
    pub time: f64,
}

impl NsDate {
    pub fn unix_millis(&self) -> i64 {
        (self.time * 1000.0) as i64 + APPLE_EPOCH_OFFSET * 1000
    }

    pub fn from_system_time(t: std::time::SystemTime) -> Self {
        let unix = match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => -e.duration().as_secs_f64(),
        };
        Self {
            time: unix - APPLE_EPOCH_OFFSET as f64,
        }
    }

    pub fn to_chrono(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.unix_millis())
    }

    pub fn from_chrono(t: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            time: (t.timestamp_millis() - APPLE_EPOCH_OFFSET * 1000) as f64 / 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NsError {
    pub code: i64,
    pub domain: String,
    pub user_info: IndexMap<String, ArchiveValue>,
}

impl std::fmt::Display for NsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.domain, self.code)?;
        if let Some(desc) = self
            .user_info
            .get("NSLocalizedDescription")
            .and_then(|d| d.as_string())
        {
            write!(f, ": {desc}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NsUrl {
    pub base: Option<String>,
    pub relative: String,
}

impl NsUrl {
    pub fn new(relative: impl Into<String>) -> Self {
        Self {
            base: None,
            relative: relative.into(),
        }
    }

    /// A `file://` URL for an absolute device path
    pub fn file(path: &str) -> Self {
        Self::new(format!("file://{path}"))
    }
}

impl std::fmt::Display for NsUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.base {
            Some(base) => write!(f, "{base}{}", self.relative),
            None => write!(f, "{}", self.relative),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NsValue {
    pub rect: Option<String>,
    pub special: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XctCapabilities {
    pub capabilities: IndexMap<String, ArchiveValue>,
}

impl XctCapabilities {
    /// What an IDE announces when driving a test run
    pub fn ide() -> Self {
        let capabilities = [
            "expected failure test capability",
            "test case run configurations",
            "test timeout capability",
            "test iterations",
            "request diagnostics for specific devices",
            "delayed attachment transfer",
            "skipped test capability",
            "daemon container sandbox extension",
            "ubiquitous test identifiers",
            "XCTIssue capability",
        ]
        .into_iter()
        .map(|c| (c.to_string(), ArchiveValue::Boolean(true)))
        .collect();
        Self { capabilities }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XctTestIdentifier {
    pub components: Vec<String>,
    pub options: u64,
}

impl XctTestIdentifier {
    /// Parses `[Module.]Class[/method]`
    ///
    /// The module is dropped since devices only honor it when running tests,
    /// not when skipping them.
    pub fn parse(test: &str) -> Self {
        let (head, method) = match test.split_once('/') {
            Some((head, method)) => (head, method.split_once('.').map_or(method, |(m, _)| m)),
            None => (test, ""),
        };
        let class = head.split_once('.').map_or(head, |(_, c)| c);

        let mut components = vec![class.to_string()];
        let mut options = 3;
        if !method.is_empty() {
            components.push(method.to_string());
            options = 2;
        }
        Self {
            components,
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XcTestConfiguration {
    pub contents: IndexMap<String, ArchiveValue>,
}

/// Inputs for building a test run configuration
#[derive(Debug, Clone)]
pub struct XcTestConfigurationParams {
    pub product_module_name: String,
    pub session_identifier: uuid::Uuid,
    pub target_application_bundle_id: String,
    pub target_application_path: String,
    pub test_bundle_url: String,
    pub tests_to_run: Option<Vec<String>>,
    pub tests_to_skip: Option<Vec<String>>,
    pub is_xctest: bool,
    pub ios_major_version: u64,
}

impl XcTestConfiguration {
    pub fn new(params: XcTestConfigurationParams) -> Self {
        let mut c = IndexMap::new();
        let mut set = |k: &str, v: ArchiveValue| {
            c.insert(k.to_string(), v);
        };

        if !params.target_application_path.is_empty()
            && !params.target_application_bundle_id.is_empty()
        {
            set(
                "productModuleName",
                params.product_module_name.clone().into(),
            );
            set(
                "targetApplicationBundleID",
                params.target_application_bundle_id.into(),
            );
            set(
                "targetApplicationPath",
                params.target_application_path.into(),
            );
        }

        let mut stats = IndexMap::new();
        stats.insert(
            "XCSuiteRecordsKey".to_string(),
            ArchiveValue::Dictionary(IndexMap::new()),
        );
        set("aggregateStatisticsBeforeCrash", stats.into());
        set(
            "automationFrameworkPath",
            if params.ios_major_version >= 17 {
                "/System/Developer/Library/PrivateFrameworks/XCTAutomationSupport.framework"
            } else {
                "/Developer/Library/PrivateFrameworks/XCTAutomationSupport.framework"
            }
            .into(),
        );
        set("baselineFileRelativePath", ArchiveValue::Null);
        set("baselineFileURL", ArchiveValue::Null);
        set("defaultTestExecutionTimeAllowance", ArchiveValue::Null);
        set("disablePerformanceMetrics", false.into());
        set("emitOSLogs", false.into());
        set("gatherLocalizableStringsData", false.into());
        set("initializeForUITesting", (!params.is_xctest).into());
        set("maximumTestExecutionTimeAllowance", ArchiveValue::Null);
        set("randomExecutionOrderingSeed", ArchiveValue::Null);
        set("reportActivities", true.into());
        set("reportResultsToIDE", true.into());
        set(
            "sessionIdentifier",
            NsObject::Uuid(params.session_identifier).into(),
        );
        set(
            "systemAttachmentLifetime",
            ATTACHMENT_LIFETIME_DELETE_ALWAYS.into(),
        );
        set("testApplicationUserOverrides", ArchiveValue::Null);
        set("testBundleRelativePath", ArchiveValue::Null);
        set(
            "testBundleURL",
            NsObject::Url(NsUrl::new(params.test_bundle_url)).into(),
        );
        set("testExecutionOrdering", 0u64.into());
        set("testsDrivenByIDE", false.into());
        set("testsMustRunOnMainThread", true.into());
        set("testTimeoutsEnabled", false.into());
        set("treatMissingBaselinesAsFailures", false.into());
        set(
            "userAttachmentLifetime",
            ATTACHMENT_LIFETIME_KEEP_ALWAYS.into(),
        );
        set("preferredScreenCaptureFormat", 2u64.into());
        set(
            "IDECapabilities",
            NsObject::Capabilities(XctCapabilities::ide()).into(),
        );

        let tests = |list: &[String]| {
            (
                ArchiveValue::Set(list.iter().map(|t| t.as_str().into()).collect()),
                ArchiveValue::Object(NsObject::TestIdentifierSet(
                    list.iter().map(|t| XctTestIdentifier::parse(t)).collect(),
                )),
            )
        };
        if let Some(run) = &params.tests_to_run {
            let (names, ids) = tests(run);
            set("testsToRun", names);
            set("testIdentifiersToRun", ids);
        }
        if let Some(skip) = &params.tests_to_skip {
            let (names, ids) = tests(skip);
            set("testsToSkip", names);
            set("testIdentifiersToSkip", ids);
        }

        Self { contents: c }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XcActivityRecord {
    pub finish: Option<NsDate>,
    pub start: Option<NsDate>,
    pub title: Option<String>,
    pub uuid: Option<uuid::Uuid>,
    pub activity_type: Option<String>,
    pub attachments: Vec<ArchiveValue>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XctAttachment {
    pub lifetime: u64,
    pub uniform_type_identifier: Option<String>,
    pub file_name_override: Option<String>,
    pub timestamp: Option<f64>,
    pub name: Option<String>,
    pub user_info: IndexMap<String, ArchiveValue>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XctIssue {
    pub runtime_issue_severity: u64,
    pub detailed_description: Option<String>,
    pub compact_description: Option<String>,
    pub source_code_context: Option<XctSourceCodeContext>,
    /// Archived as `XCTMutableIssue`
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XctSourceCodeContext {
    pub location: Option<XctSourceCodeLocation>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XctSourceCodeLocation {
    pub file_url: Option<NsUrl>,
    pub line_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtCpuClusterInfo {
    pub cluster_id: u64,
    pub cluster_flags: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapMessageKind {
    Tap,
    ActivityTrace,
    Sysmon,
    KTrace,
    Heartbeat,
    Status,
}

impl TapMessageKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            TapMessageKind::Tap => "DTTapMessage",
            TapMessageKind::ActivityTrace => "DTActivityTraceTapMessage",
            TapMessageKind::Sysmon => "DTSysmonTapMessage",
            TapMessageKind::KTrace => "DTKTraceTapMessage",
            TapMessageKind::Heartbeat => "DTTapHeartbeatMessage",
            TapMessageKind::Status => "DTTapStatusMessage",
        }
    }

    fn from_class(name: &str) -> Self {
        match name {
            "DTActivityTraceTapMessage" => TapMessageKind::ActivityTrace,
            "DTSysmonTapMessage" => TapMessageKind::Sysmon,
            "DTKTraceTapMessage" => TapMessageKind::KTrace,
            "DTTapHeartbeatMessage" => TapMessageKind::Heartbeat,
            "DTTapStatusMessage" => TapMessageKind::Status,
            _ => TapMessageKind::Tap,
        }
    }
}

/// A tap message wrapping its `DTTapMessagePlist` payload
#[derive(Debug, Clone, PartialEq)]
pub struct DtTapMessage {
    pub kind: TapMessageKind,
    pub plist: Box<ArchiveValue>,
}

fn mismatch(class: &str, value: &ArchiveValue) -> ArchiveError {
    ArchiveError::UnsupportedType(format!("{value:?} cannot be archived as {class}"))
}

fn malformed(key: &str, expected: &str, got: &ArchiveValue) -> ArchiveError {
    ArchiveError::Malformed(format!("{key}: expected {expected}, got {got}"))
}

fn opt_string(v: ArchiveValue, key: &str) -> Result<Option<String>, ArchiveError> {
    match v {
        ArchiveValue::Null => Ok(None),
        ArchiveValue::String(s) => Ok(Some(s)),
        other => Err(malformed(key, "string", &other)),
    }
}

fn unsigned(v: ArchiveValue, key: &str) -> Result<u64, ArchiveError> {
    match &v {
        ArchiveValue::Null => Ok(0),
        ArchiveValue::Integer(i) => i
            .as_unsigned()
            .or_else(|| i.as_signed().map(|s| s as u64))
            .ok_or_else(|| malformed(key, "integer", &v)),
        _ => Err(malformed(key, "integer", &v)),
    }
}

fn opt_real(v: ArchiveValue, key: &str) -> Result<Option<f64>, ArchiveError> {
    match &v {
        ArchiveValue::Null => Ok(None),
        ArchiveValue::Real(r) => Ok(Some(*r)),
        ArchiveValue::Integer(i) => Ok(i.as_signed().map(|s| s as f64)),
        _ => Err(malformed(key, "real", &v)),
    }
}

fn dictionary(v: ArchiveValue, key: &str) -> Result<IndexMap<String, ArchiveValue>, ArchiveError> {
    match v {
        ArchiveValue::Null => Ok(IndexMap::new()),
        ArchiveValue::Dictionary(d) => Ok(d),
        other => Err(malformed(key, "dictionary", &other)),
    }
}

fn opt_date(v: ArchiveValue, key: &str) -> Result<Option<NsDate>, ArchiveError> {
    match v {
        ArchiveValue::Null => Ok(None),
        ArchiveValue::Object(NsObject::Date(d)) => Ok(Some(d)),
        other => Err(malformed(key, "NSDate", &other)),
    }
}

fn opt_url(v: ArchiveValue, key: &str) -> Result<Option<NsUrl>, ArchiveError> {
    match v {
        ArchiveValue::Null => Ok(None),
        ArchiveValue::Object(NsObject::Url(u)) => Ok(Some(u)),
        other => Err(malformed(key, "NSURL", &other)),
    }
}

fn put(
    a: &mut Archiver,
    d: &mut plist::Dictionary,
    key: &str,
    v: &ArchiveValue,
) -> Result<(), ArchiveError> {
    let encoded = a.encode_field(v)?;
    d.insert(key.to_string(), encoded);
    Ok(())
}

fn put_str(
    a: &mut Archiver,
    d: &mut plist::Dictionary,
    key: &str,
    v: &Option<String>,
) -> Result<(), ArchiveError> {
    let v = match v {
        Some(s) => ArchiveValue::String(s.clone()),
        None => ArchiveValue::Null,
    };
    put(a, d, key, &v)
}

fn object(v: &ArchiveValue) -> Option<&NsObject> {
    v.as_object()
}

fn decode_null(
    _: &str,
    _: &plist::Dictionary,
    _: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    Ok(ArchiveValue::Null)
}

fn encode_null(v: &ArchiveValue, _: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    match v {
        ArchiveValue::Null => Ok(plist::Dictionary::new()),
        _ => Err(mismatch("NSNull", v)),
    }
}

fn decode_string(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    match u.field(d, "NS.string")? {
        s @ ArchiveValue::String(_) => Ok(s),
        other => Err(malformed("NS.string", "string", &other)),
    }
}

fn encode_string(v: &ArchiveValue, _: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let s = v.as_string().ok_or_else(|| mismatch("NSString", v))?;
    let mut d = plist::Dictionary::new();
    d.insert("NS.string".into(), s.into());
    Ok(d)
}

fn decode_data(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    match u.field(d, "NS.data")? {
        ArchiveValue::Null => Ok(ArchiveValue::Data(Vec::new())),
        data @ ArchiveValue::Data(_) => Ok(data),
        other => Err(malformed("NS.data", "data", &other)),
    }
}

fn encode_data(v: &ArchiveValue, _: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let data = v.as_data().ok_or_else(|| mismatch("NSData", v))?;
    let mut d = plist::Dictionary::new();
    d.insert("NS.data".into(), plist::Value::Data(data.to_vec()));
    Ok(d)
}

fn decode_array(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    Ok(ArchiveValue::Array(u.refs(d, "NS.objects")?))
}

fn decode_set(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    Ok(ArchiveValue::Set(u.refs(d, "NS.objects")?))
}

fn encode_array(v: &ArchiveValue, a: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let items = v.as_array().ok_or_else(|| mismatch("NSArray", v))?;
    let mut d = plist::Dictionary::new();
    d.insert("NS.objects".into(), a.encode_refs(items)?);
    Ok(d)
}

fn decode_dictionary(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let keys = u.refs(d, "NS.keys")?;
    let values = u.refs(d, "NS.objects")?;
    if keys.len() != values.len() {
        return Err(ArchiveError::Malformed(format!(
            "dictionary has {} keys and {} values",
            keys.len(),
            values.len()
        )));
    }
    Ok(ArchiveValue::Dictionary(
        keys.into_iter()
            .zip(values)
            .map(|(k, v)| {
                let k = match k {
                    ArchiveValue::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect(),
    ))
}

fn encode_dictionary(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let map = v.as_dictionary().ok_or_else(|| mismatch("NSDictionary", v))?;
    let mut keys = Vec::with_capacity(map.len());
    let mut values = Vec::with_capacity(map.len());
    for (k, v) in map {
        keys.push(plist::Value::Uid(a.encode_ref(&ArchiveValue::String(k.clone()))?));
        values.push(plist::Value::Uid(a.encode_ref(v)?));
    }
    let mut d = plist::Dictionary::new();
    d.insert("NS.keys".into(), plist::Value::Array(keys));
    d.insert("NS.objects".into(), plist::Value::Array(values));
    Ok(d)
}

fn decode_date(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let v = u.field(d, "NS.time")?;
    let time = opt_real(v, "NS.time")?.unwrap_or_default();
    Ok(NsObject::Date(NsDate { time }).into())
}

fn encode_date(v: &ArchiveValue, _: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::Date(date)) = object(v) else {
        return Err(mismatch("NSDate", v));
    };
    let mut d = plist::Dictionary::new();
    d.insert("NS.time".into(), date.time.into());
    Ok(d)
}

fn decode_uuid(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let v = u.field(d, "NS.uuidbytes")?;
    let bytes = v
        .as_data()
        .ok_or_else(|| malformed("NS.uuidbytes", "data", &v))?;
    let id = uuid::Uuid::from_slice(bytes)
        .map_err(|e| ArchiveError::Malformed(format!("NS.uuidbytes: {e}")))?;
    Ok(NsObject::Uuid(id).into())
}

fn encode_uuid(v: &ArchiveValue, _: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::Uuid(id)) = object(v) else {
        return Err(mismatch("NSUUID", v));
    };
    let mut d = plist::Dictionary::new();
    d.insert(
        "NS.uuidbytes".into(),
        plist::Value::Data(id.as_bytes().to_vec()),
    );
    Ok(d)
}

fn decode_error(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let code = match u.field(d, "NSCode")? {
        ArchiveValue::Integer(i) => i
            .as_signed()
            .or_else(|| i.as_unsigned().map(|c| c as i64))
            .unwrap_or_default(),
        ArchiveValue::Null => 0,
        other => return Err(malformed("NSCode", "integer", &other)),
    };
    let domain = opt_string(u.field(d, "NSDomain")?, "NSDomain")?.unwrap_or_default();
    let user_info = dictionary(u.field(d, "NSUserInfo")?, "NSUserInfo")?;
    Ok(NsObject::Error(NsError {
        code,
        domain,
        user_info,
    })
    .into())
}

fn encode_error(v: &ArchiveValue, a: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::Error(e)) = object(v) else {
        return Err(mismatch("NSError", v));
    };
    let mut d = plist::Dictionary::new();
    d.insert("NSCode".into(), e.code.into());
    put(a, &mut d, "NSDomain", &e.domain.as_str().into())?;
    put(a, &mut d, "NSUserInfo", &e.user_info.clone().into())?;
    Ok(d)
}

fn decode_url(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let base = match u.field(d, "NS.base")? {
        ArchiveValue::Null => None,
        ArchiveValue::String(s) => Some(s),
        ArchiveValue::Object(NsObject::Url(url)) => Some(url.to_string()),
        other => return Err(malformed("NS.base", "NSURL", &other)),
    };
    let relative = opt_string(u.field(d, "NS.relative")?, "NS.relative")?.unwrap_or_default();
    Ok(NsObject::Url(NsUrl { base, relative }).into())
}

fn encode_url(v: &ArchiveValue, a: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::Url(url)) = object(v) else {
        return Err(mismatch("NSURL", v));
    };
    let mut d = plist::Dictionary::new();
    put_str(a, &mut d, "NS.base", &url.base)?;
    put(a, &mut d, "NS.relative", &url.relative.as_str().into())?;
    Ok(d)
}

fn decode_value(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let rect = opt_string(u.field(d, "NS.rectval")?, "NS.rectval")?;
    let special = unsigned(u.field(d, "NS.special")?, "NS.special")?;
    Ok(NsObject::Value(NsValue { rect, special }).into())
}

fn encode_value(v: &ArchiveValue, a: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::Value(value)) = object(v) else {
        return Err(mismatch("NSValue", v));
    };
    let mut d = plist::Dictionary::new();
    put_str(a, &mut d, "NS.rectval", &value.rect)?;
    d.insert("NS.special".into(), value.special.into());
    Ok(d)
}

fn decode_capabilities(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let capabilities = dictionary(
        u.field(d, "capabilities-dictionary")?,
        "capabilities-dictionary",
    )?;
    Ok(NsObject::Capabilities(XctCapabilities { capabilities }).into())
}

fn encode_capabilities(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::Capabilities(caps)) = object(v) else {
        return Err(mismatch("XCTCapabilities", v));
    };
    let mut d = plist::Dictionary::new();
    put(
        a,
        &mut d,
        "capabilities-dictionary",
        &caps.capabilities.clone().into(),
    )?;
    Ok(d)
}

fn test_identifier(v: ArchiveValue) -> Result<XctTestIdentifier, ArchiveError> {
    match v {
        ArchiveValue::Object(NsObject::TestIdentifier(t)) => Ok(t),
        other => Err(malformed("identifiers", "XCTTestIdentifier", &other)),
    }
}

fn decode_test_identifier(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let components = match u.field(d, "c")? {
        ArchiveValue::Null => Vec::new(),
        ArchiveValue::Array(items) => items
            .into_iter()
            .map(|c| opt_string(c, "c").map(Option::unwrap_or_default))
            .collect::<Result<_, _>>()?,
        other => return Err(malformed("c", "array", &other)),
    };
    let options = unsigned(u.field(d, "o")?, "o")?;
    Ok(NsObject::TestIdentifier(XctTestIdentifier {
        components,
        options,
    })
    .into())
}

fn encode_test_identifier(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::TestIdentifier(t)) = object(v) else {
        return Err(mismatch("XCTTestIdentifier", v));
    };
    let components = ArchiveValue::Array(
        t.components
            .iter()
            .map(|c| ArchiveValue::String(c.clone()))
            .collect(),
    );
    let mut d = plist::Dictionary::new();
    put(a, &mut d, "c", &components)?;
    d.insert("o".into(), t.options.into());
    Ok(d)
}

fn decode_test_identifier_set(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let identifiers = match u.field(d, "identifiers")? {
        ArchiveValue::Null => Vec::new(),
        ArchiveValue::Array(items) | ArchiveValue::Set(items) => items
            .into_iter()
            .map(test_identifier)
            .collect::<Result<_, _>>()?,
        other => return Err(malformed("identifiers", "array", &other)),
    };
    Ok(NsObject::TestIdentifierSet(identifiers).into())
}

fn encode_test_identifier_set(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::TestIdentifierSet(ids)) = object(v) else {
        return Err(mismatch("XCTTestIdentifierSet", v));
    };
    let items = ArchiveValue::Array(
        ids.iter()
            .map(|t| NsObject::TestIdentifier(t.clone()).into())
            .collect(),
    );
    let mut d = plist::Dictionary::new();
    let identifiers = a.encode_with_class("NSMutableArray", &items)?;
    d.insert("identifiers".into(), plist::Value::Uid(identifiers));
    Ok(d)
}

fn decode_test_configuration(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let mut contents = IndexMap::new();
    for key in d.keys().filter(|k| k.as_str() != "$class") {
        let value = match u.field(d, key) {
            Ok(v) => v,
            Err(ArchiveError::UnknownClass(class)) => {
                debug!("XCTestConfiguration {key} holds unknown class {class}");
                ArchiveValue::Null
            }
            Err(e) => return Err(e),
        };
        contents.insert(key.clone(), value);
    }
    Ok(NsObject::TestConfiguration(XcTestConfiguration { contents }).into())
}

fn encode_test_configuration(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::TestConfiguration(config)) = object(v) else {
        return Err(mismatch("XCTestConfiguration", v));
    };
    let mut d = plist::Dictionary::new();
    for (k, v) in &config.contents {
        put(a, &mut d, k, v)?;
    }
    Ok(d)
}

fn decode_activity_record(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let uuid = match u.field(d, "uuid")? {
        ArchiveValue::Null => None,
        ArchiveValue::Object(NsObject::Uuid(id)) => Some(id),
        other => return Err(malformed("uuid", "NSUUID", &other)),
    };
    let attachments = match u.field(d, "attachments")? {
        ArchiveValue::Null => Vec::new(),
        ArchiveValue::Array(items) => items,
        other => return Err(malformed("attachments", "array", &other)),
    };
    Ok(NsObject::ActivityRecord(XcActivityRecord {
        finish: opt_date(u.field(d, "finish")?, "finish")?,
        start: opt_date(u.field(d, "start")?, "start")?,
        title: opt_string(u.field(d, "title")?, "title")?,
        uuid,
        activity_type: opt_string(u.field(d, "activityType")?, "activityType")?,
        attachments,
    })
    .into())
}

fn encode_activity_record(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::ActivityRecord(r)) = object(v) else {
        return Err(mismatch("XCActivityRecord", v));
    };
    let date = |d: Option<NsDate>| d.map_or(ArchiveValue::Null, |d| NsObject::Date(d).into());
    let mut d = plist::Dictionary::new();
    put(a, &mut d, "finish", &date(r.finish))?;
    put(a, &mut d, "start", &date(r.start))?;
    put_str(a, &mut d, "title", &r.title)?;
    put(
        a,
        &mut d,
        "uuid",
        &r.uuid.map_or(ArchiveValue::Null, |id| NsObject::Uuid(id).into()),
    )?;
    put_str(a, &mut d, "activityType", &r.activity_type)?;
    put(a, &mut d, "attachments", &ArchiveValue::Array(r.attachments.clone()))?;
    Ok(d)
}

fn decode_attachment(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let payload = match u.field(d, "payload")? {
        ArchiveValue::Null => Vec::new(),
        ArchiveValue::Data(data) => data,
        other => return Err(malformed("payload", "data", &other)),
    };
    Ok(NsObject::Attachment(XctAttachment {
        lifetime: unsigned(u.field(d, "lifetime")?, "lifetime")?,
        uniform_type_identifier: opt_string(
            u.field(d, "uniformTypeIdentifier")?,
            "uniformTypeIdentifier",
        )?,
        file_name_override: opt_string(u.field(d, "fileNameOverride")?, "fileNameOverride")?,
        timestamp: opt_real(u.field(d, "timestamp")?, "timestamp")?,
        name: opt_string(u.field(d, "name")?, "name")?,
        user_info: dictionary(u.field(d, "userInfo")?, "userInfo")?,
        payload,
    })
    .into())
}

fn encode_attachment(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::Attachment(att)) = object(v) else {
        return Err(mismatch("XCTAttachment", v));
    };
    let mut d = plist::Dictionary::new();
    d.insert("lifetime".into(), att.lifetime.into());
    put_str(a, &mut d, "uniformTypeIdentifier", &att.uniform_type_identifier)?;
    put_str(a, &mut d, "fileNameOverride", &att.file_name_override)?;
    put(
        a,
        &mut d,
        "timestamp",
        &att.timestamp.map_or(ArchiveValue::Null, ArchiveValue::Real),
    )?;
    put_str(a, &mut d, "name", &att.name)?;
    put(a, &mut d, "userInfo", &att.user_info.clone().into())?;
    put(a, &mut d, "payload", &ArchiveValue::Data(att.payload.clone()))?;
    Ok(d)
}

fn decode_issue(
    class: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let source_code_context = match u.field(d, "source-code-context")? {
        ArchiveValue::Null => None,
        ArchiveValue::Object(NsObject::SourceCodeContext(c)) => Some(c),
        other => {
            return Err(malformed(
                "source-code-context",
                "XCTSourceCodeContext",
                &other,
            ));
        }
    };
    Ok(NsObject::Issue(XctIssue {
        runtime_issue_severity: unsigned(
            u.field(d, "runtimeIssueSeverity")?,
            "runtimeIssueSeverity",
        )?,
        detailed_description: opt_string(
            u.field(d, "detailed-description")?,
            "detailed-description",
        )?,
        compact_description: opt_string(
            u.field(d, "compact-description")?,
            "compact-description",
        )?,
        source_code_context,
        mutable: class == "XCTMutableIssue",
    })
    .into())
}

fn encode_issue(v: &ArchiveValue, a: &mut Archiver) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::Issue(issue)) = object(v) else {
        return Err(mismatch("XCTIssue", v));
    };
    let mut d = plist::Dictionary::new();
    d.insert(
        "runtimeIssueSeverity".into(),
        issue.runtime_issue_severity.into(),
    );
    put_str(a, &mut d, "detailed-description", &issue.detailed_description)?;
    put_str(a, &mut d, "compact-description", &issue.compact_description)?;
    let context = issue
        .source_code_context
        .clone()
        .map_or(ArchiveValue::Null, |c| NsObject::SourceCodeContext(c).into());
    put(a, &mut d, "source-code-context", &context)?;
    Ok(d)
}

fn decode_source_code_context(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    let location = match u.field(d, "location")? {
        ArchiveValue::Null => None,
        ArchiveValue::Object(NsObject::SourceCodeLocation(l)) => Some(l),
        other => return Err(malformed("location", "XCTSourceCodeLocation", &other)),
    };
    Ok(NsObject::SourceCodeContext(XctSourceCodeContext { location }).into())
}

fn encode_source_code_context(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::SourceCodeContext(c)) = object(v) else {
        return Err(mismatch("XCTSourceCodeContext", v));
    };
    let location = c
        .location
        .clone()
        .map_or(ArchiveValue::Null, |l| NsObject::SourceCodeLocation(l).into());
    let mut d = plist::Dictionary::new();
    put(a, &mut d, "location", &location)?;
    Ok(d)
}

fn decode_source_code_location(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    Ok(NsObject::SourceCodeLocation(XctSourceCodeLocation {
        file_url: opt_url(u.field(d, "file-url")?, "file-url")?,
        line_number: unsigned(u.field(d, "line-number")?, "line-number")?,
    })
    .into())
}

fn encode_source_code_location(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::SourceCodeLocation(l)) = object(v) else {
        return Err(mismatch("XCTSourceCodeLocation", v));
    };
    let url = l
        .file_url
        .clone()
        .map_or(ArchiveValue::Null, |u| NsObject::Url(u).into());
    let mut d = plist::Dictionary::new();
    put(a, &mut d, "file-url", &url)?;
    d.insert("line-number".into(), l.line_number.into());
    Ok(d)
}

fn decode_cpu_cluster_info(
    _: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    Ok(NsObject::CpuClusterInfo(DtCpuClusterInfo {
        cluster_id: unsigned(u.field(d, "_clusterID")?, "_clusterID")?,
        cluster_flags: unsigned(u.field(d, "_clusterFlags")?, "_clusterFlags")?,
    })
    .into())
}

fn encode_cpu_cluster_info(
    v: &ArchiveValue,
    _: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::CpuClusterInfo(info)) = object(v) else {
        return Err(mismatch("DTCPUClusterInfo", v));
    };
    let mut d = plist::Dictionary::new();
    d.insert("_clusterID".into(), info.cluster_id.into());
    d.insert("_clusterFlags".into(), info.cluster_flags.into());
    Ok(d)
}

fn decode_tap_message(
    class: &str,
    d: &plist::Dictionary,
    u: &mut Unarchiver<'_>,
) -> Result<ArchiveValue, ArchiveError> {
    Ok(NsObject::TapMessage(DtTapMessage {
        kind: TapMessageKind::from_class(class),
        plist: Box::new(u.field(d, "DTTapMessagePlist")?),
    })
    .into())
}

fn encode_tap_message(
    v: &ArchiveValue,
    a: &mut Archiver,
) -> Result<plist::Dictionary, ArchiveError> {
    let Some(NsObject::TapMessage(tap)) = object(v) else {
        return Err(mismatch("DTTapMessage", v));
    };
    let mut d = plist::Dictionary::new();
    put(a, &mut d, "DTTapMessagePlist", &tap.plist)?;
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nskeyedarchive::{archive, archive_text, unarchive};

    fn round_trip(value: ArchiveValue) -> ArchiveValue {
        let bytes = archive(&value).unwrap();
        let mut decoded = unarchive(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        let decoded = decoded.remove(0);
        assert_eq!(decoded, value);
        decoded
    }

    #[test]
    fn registry_is_unique() {
        for (i, c) in CLASSES.iter().enumerate() {
            assert_eq!(c.chain[0], c.name);
            assert_eq!(c.chain.last(), Some(&"NSObject"));
            assert!(CLASSES[i + 1..].iter().all(|o| o.name != c.name));
        }
    }

    #[test]
    fn foundation_objects() {
        round_trip(NsObject::Date(NsDate { time: 700000000.5 }).into());
        round_trip(NsObject::Uuid(uuid::Uuid::new_v4()).into());
        round_trip(NsObject::Url(NsUrl::file("/private/var/tmp")).into());
        round_trip(
            NsObject::Value(NsValue {
                rect: Some("{{0, 0}, {390, 844}}".into()),
                special: 12,
            })
            .into(),
        );

        let mut user_info = IndexMap::new();
        user_info.insert(
            "NSLocalizedDescription".to_string(),
            ArchiveValue::from("no such process"),
        );
        let err = round_trip(
            NsObject::Error(NsError {
                code: -1,
                domain: "DTXMessage".into(),
                user_info,
            })
            .into(),
        );
        assert_eq!(err.to_string(), "DTXMessage (-1): no such process");
    }

    #[test]
    fn date_conversion() {
        let d = NsDate { time: 0.0 };
        assert_eq!(d.unix_millis(), 978_307_200_000);
        let c = d.to_chrono().unwrap();
        assert_eq!(c.to_rfc3339(), "2001-01-01T00:00:00+00:00");
        assert_eq!(NsDate::from_chrono(c), d);
    }

    #[test]
    fn test_identifiers() {
        let t = XctTestIdentifier::parse("MyTests.LoginTests/testLogin");
        assert_eq!(t.components, vec!["LoginTests", "testLogin"]);
        assert_eq!(t.options, 2);

        let t = XctTestIdentifier::parse("LoginTests");
        assert_eq!(t.components, vec!["LoginTests"]);
        assert_eq!(t.options, 3);
    }

    #[test]
    fn test_configuration() {
        let config = XcTestConfiguration::new(XcTestConfigurationParams {
            product_module_name: "UITests".into(),
            session_identifier: uuid::Uuid::new_v4(),
            target_application_bundle_id: "com.example.app".into(),
            target_application_path: "/private/var/containers/Bundle/Application/X/App.app"
                .into(),
            test_bundle_url: "file:///private/var/containers/UITests.xctest".into(),
            tests_to_run: Some(vec!["UITests.LoginTests/testLogin".into()]),
            tests_to_skip: None,
            is_xctest: false,
            ios_major_version: 17,
        });
        assert_eq!(
            config.contents.get("automationFrameworkPath"),
            Some(&ArchiveValue::from(
                "/System/Developer/Library/PrivateFrameworks/XCTAutomationSupport.framework"
            ))
        );
        assert_eq!(
            config.contents.get("initializeForUITesting"),
            Some(&ArchiveValue::Boolean(true))
        );
        assert!(!config.contents.contains_key("testsToSkip"));

        let value: ArchiveValue = NsObject::TestConfiguration(config).into();
        round_trip(value.clone());

        // the identifier list goes out as a mutable array
        let text = archive_text(&value).unwrap();
        assert!(text.contains("<string>NSMutableArray</string>"));
        assert!(text.contains("<string>XCTTestIdentifierSet</string>"));
    }

    #[test]
    fn test_runner_records() {
        let location = XctSourceCodeLocation {
            file_url: Some(NsUrl::file("/tmp/LoginTests.swift")),
            line_number: 42,
        };
        round_trip(
            NsObject::Issue(XctIssue {
                runtime_issue_severity: 1,
                detailed_description: Some("XCTAssertTrue failed".into()),
                compact_description: Some("failed".into()),
                source_code_context: Some(XctSourceCodeContext {
                    location: Some(location),
                }),
                mutable: true,
            })
            .into(),
        );

        let attachment = XctAttachment {
            lifetime: 0,
            uniform_type_identifier: Some("public.png".into()),
            file_name_override: None,
            timestamp: Some(700000000.0),
            name: Some("screenshot".into()),
            user_info: IndexMap::new(),
            payload: vec![0x89, 0x50, 0x4e, 0x47],
        };
        round_trip(
            NsObject::ActivityRecord(XcActivityRecord {
                finish: None,
                start: Some(NsDate { time: 700000000.0 }),
                title: Some("Tap button".into()),
                uuid: Some(uuid::Uuid::new_v4()),
                activity_type: Some("com.apple.dt.xctest.activity-type.userCreated".into()),
                attachments: vec![NsObject::Attachment(attachment).into()],
            })
            .into(),
        );
    }

    #[test]
    fn tap_messages() {
        let mut payload = IndexMap::new();
        payload.insert("Type".to_string(), ArchiveValue::from(7u64));
        let tap = round_trip(
            NsObject::TapMessage(DtTapMessage {
                kind: TapMessageKind::Sysmon,
                plist: Box::new(payload.into()),
            })
            .into(),
        );
        assert_eq!(tap.class_name(), Some("DTSysmonTapMessage"));

        round_trip(
            NsObject::CpuClusterInfo(DtCpuClusterInfo {
                cluster_id: 1,
                cluster_flags: 0,
            })
            .into(),
        );
    }
}
