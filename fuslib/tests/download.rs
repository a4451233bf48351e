mod common;

use std::{fs, sync::Arc};

use aes::Aes128;
use assert_matches::assert_matches;
use block_padding::Pkcs7;
use cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use tempfile::TempDir;

use fuslib::{
    catalogue::{Catalogue, CatalogueError},
    constants::{
        BINARY_DOWNLOAD_ENDPOINT, BINARY_INFORM_ENDPOINT, BINARY_INIT_ENDPOINT,
        NONCE_ENDPOINT,
    },
    crypto::{self, FusKeys},
    metadata::{BinaryNature, DecryptScheme, FirmwareMetadata, MetadataError},
    session::{ProtocolError, SessionBuilder, SessionState, TransportError},
    transfer::{TransferObserver, TransferOptions, TransferPipeline},
    version::FwVersion,
};

use common::{
    FakeServer, Reply, Request, ROTATED_NONCE, ROTATED_NONCE_TOKEN, ROTATED_SIGNATURE,
    TEST_FIXED_KEY, TEST_FLEXIBLE_KEY_SUFFIX, TEST_NONCE, TEST_NONCE_TOKEN,
};

const MODEL: &str = "SM-T000";
const REGION: &str = "XAA";
const VERSION: &str = "T000XXU1AAA1/T000OXM1AAA1/T000XXU1AAA1/T000XXU1AAA1";
const FILE_NAME: &str = "SM-T000_1_20230101_abc.zip.enc4";
const MODEL_PATH: &str = "/neofus/9/";
const LOGIC_VALUE_HOME: &str = "j3ri0n2b0ah9vd7u";
const SESSION_ID: &str = "test-session";

#[derive(Default)]
struct Progress {
    total: u64,
    bytes: u64,
}

impl TransferObserver for Progress {
    fn on_start(&mut self, _offset: u64, total: u64) {
        self.total = total;
    }

    fn on_progress(&mut self, bytes: u64) {
        self.bytes += bytes;
    }
}

struct Firmware {
    plaintext: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl Firmware {
    fn new() -> Self {
        let plaintext: Vec<u8> = (0..5000).map(|i| (i * 7 % 256) as u8).collect();
        let key = crypto::derive_key_v4(false, VERSION, LOGIC_VALUE_HOME, "unused");
        let ciphertext = Aes128::new(GenericArray::from_slice(&key))
            .encrypt_padded_vec::<Pkcs7>(&plaintext);

        Self { plaintext, ciphertext }
    }

    fn inform_xml(&self, status: &str) -> String {
        let fields = [
            ("BINARY_NATURE", "0".to_owned()),
            ("DEVICE_MODEL_NAME", MODEL.to_owned()),
            ("DEVICE_LOCAL_CODE", REGION.to_owned()),
            ("MODEL_PATH", MODEL_PATH.to_owned()),
            ("DESCRIPTION", String::new()),
            ("LOGIC_VALUE_HOME", LOGIC_VALUE_HOME.to_owned()),
            ("LOGIC_VALUE_FACTORY", "unused".to_owned()),
            ("CURRENT_OS_VERSION", "Android 13".to_owned()),
            ("BINARY_NAME", FILE_NAME.to_owned()),
            ("BINARY_BYTE_SIZE", self.ciphertext.len().to_string()),
            ("BINARY_CRC", crc32fast::hash(&self.ciphertext).to_string()),
        ];
        let put: String = fields.iter()
            .map(|(n, v)| format!("<{n}><Data>{v}</Data></{n}>"))
            .collect();

        format!("<FUSMsg><FUSHdr><ProtoVer>1.0</ProtoVer></FUSHdr><FUSBody><Results>\
                 <Status>{status}</Status>\
                 <LATEST_FW_VERSION><Data>{VERSION}</Data></LATEST_FW_VERSION>\
                 </Results><Put>{put}</Put></FUSBody></FUSMsg>")
    }
}

/// Behaves like FUS: every response carries a fresh nonce and the binary
/// honors `Range` requests.
fn fus_handler(firmware: Arc<Firmware>, status: &'static str) -> impl Fn(&Request) -> Reply {
    move |request: &Request| {
        let reply = Reply::new(200).header("NONCE", TEST_NONCE_TOKEN);

        match request.path().trim_start_matches('/') {
            NONCE_ENDPOINT => reply
                .header("Set-Cookie", &format!("JSESSIONID={SESSION_ID}; Path=/")),
            BINARY_INFORM_ENDPOINT => reply.body(firmware.inform_xml(status)),
            BINARY_INIT_ENDPOINT => reply.body("<FUSMsg/>"),
            BINARY_DOWNLOAD_ENDPOINT => {
                let offset = request.header("Range")
                    .and_then(|r| r.strip_prefix("bytes="))
                    .and_then(|r| r.strip_suffix('-'))
                    .and_then(|r| r.parse::<usize>().ok());

                match offset {
                    Some(o) => Reply::new(206).body(&firmware.ciphertext[o..]),
                    None => Reply::new(200).body(firmware.ciphertext.clone()),
                }
            }
            _ => Reply::new(404),
        }
    }
}

fn builder(server: &FakeServer) -> SessionBuilder {
    let keys = FusKeys::new(TEST_FIXED_KEY, TEST_FLEXIBLE_KEY_SUFFIX).unwrap();

    SessionBuilder::new(keys)
        .no_proxy(true)
        .fus_base_url(server.url())
        .cloud_base_url(server.url())
}

async fn start(status: &'static str) -> (FakeServer, Arc<Firmware>) {
    let firmware = Arc::new(Firmware::new());
    let server = FakeServer::start(fus_handler(firmware.clone(), status)).await;

    (server, firmware)
}

#[tokio::test]
async fn download_and_decrypt() {
    let (server, firmware) = start("200").await;
    let version: FwVersion = VERSION.parse().unwrap();

    let mut session = builder(&server).connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.secrets().session_id(), SESSION_ID);

    let metadata = FirmwareMetadata::fetch(&mut session, &version, MODEL, REGION,
                                           BinaryNature::Home).await.unwrap();
    assert_eq!(metadata.scheme, DecryptScheme::V4);
    assert_eq!(metadata.size, firmware.ciphertext.len() as u64);

    metadata.initialize_transfer(&mut session).await.unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join(metadata.decrypted_file_name());
    let options = TransferOptions {
        decrypt_inline: true,
        block_size: 1024,
        ..Default::default()
    };
    let mut progress = Progress::default();

    let report = TransferPipeline::new(&metadata, &path, options)
        .run(&mut session, &mut progress).await.unwrap();

    assert_eq!(report.start_offset, 0);
    assert_eq!(report.blocks, 5);
    assert_eq!(report.checksum, Some(metadata.crc));
    assert!(report.warnings.is_empty());
    assert_eq!(progress.total, firmware.ciphertext.len() as u64);
    assert_eq!(progress.bytes, progress.total);
    assert_eq!(fs::read(&path).unwrap(), firmware.plaintext);

    let requests = server.requests();
    let paths: Vec<_> = requests.iter().map(|r| r.path().to_owned()).collect();
    assert_eq!(paths, [
        format!("/{NONCE_ENDPOINT}"),
        format!("/{BINARY_INFORM_ENDPOINT}"),
        format!("/{BINARY_INIT_ENDPOINT}"),
        format!("/{BINARY_DOWNLOAD_ENDPOINT}"),
    ]);

    // Bootstrap request is unsigned
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].header("Authorization"),
               Some(r#"FUS nonce="", signature="", nc="", type="", realm="", newauth="1""#));
    assert_eq!(requests[0].header("Content-Length"), Some("0"));
    assert_eq!(requests[0].header("User-Agent"), Some("Kies2.0_FUS"));

    let signature = crypto::sign_nonce(
        &FusKeys::new(TEST_FIXED_KEY, TEST_FLEXIBLE_KEY_SUFFIX).unwrap(), TEST_NONCE).unwrap();
    for request in &requests[1..] {
        let auth = request.header("Authorization").unwrap();
        assert!(auth.contains(&format!("nonce=\"{TEST_NONCE_TOKEN}\"")));
        assert!(auth.contains(&format!("signature=\"{signature}\"")));
        assert_eq!(request.header("Cookie"), Some(format!("JSESSIONID={SESSION_ID}").as_str()));
    }

    let inform = String::from_utf8(requests[1].body.clone()).unwrap();
    let logic_check = crypto::logic_check(VERSION, TEST_NONCE);
    assert!(inform.contains(&format!("<LOGIC_CHECK><Data>{logic_check}</Data></LOGIC_CHECK>")));
    assert!(inform.contains("<CLIENT_PRODUCT><Data>Smart Switch</Data></CLIENT_PRODUCT>"));

    let init = String::from_utf8(requests[2].body.clone()).unwrap();
    assert!(init.contains(&format!("<BINARY_FILE_NAME><Data>{FILE_NAME}</Data></BINARY_FILE_NAME>")));

    assert_eq!(requests[3].method, "GET");
    assert_eq!(requests[3].target,
               format!("/{BINARY_DOWNLOAD_ENDPOINT}?file={MODEL_PATH}{FILE_NAME}"));
    assert_eq!(requests[3].header("Range"), None);
}

#[tokio::test]
async fn resume_download() {
    let (server, firmware) = start("200").await;
    let version: FwVersion = VERSION.parse().unwrap();

    let mut session = builder(&server).connect().await.unwrap();
    let metadata = FirmwareMetadata::fetch(&mut session, &version, MODEL, REGION,
                                           BinaryNature::Home).await.unwrap();
    metadata.initialize_transfer(&mut session).await.unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join(&metadata.file_name);
    fs::write(&path, &firmware.ciphertext[..1234]).unwrap();

    let options = TransferOptions {
        block_size: 1000,
        ..Default::default()
    };
    let report = TransferPipeline::new(&metadata, &path, options)
        .run(&mut session, &mut Progress::default()).await.unwrap();

    assert_eq!(report.start_offset, 1234);
    assert_eq!(report.bytes_received, firmware.ciphertext.len() as u64 - 1234);
    assert_eq!(report.checksum, Some(metadata.crc));
    assert_eq!(fs::read(&path).unwrap(), firmware.ciphertext);

    let requests = server.requests();
    assert_eq!(requests.last().and_then(|r| r.header("Range")), Some("bytes=1234-"));
}

#[tokio::test]
async fn firmware_not_found() {
    let (server, _) = start("408").await;
    let version: FwVersion = VERSION.parse().unwrap();

    let mut session = builder(&server).connect().await.unwrap();

    assert_matches!(
        FirmwareMetadata::fetch(&mut session, &version, MODEL, REGION, BinaryNature::Home).await,
        Err(MetadataError::NotFound(s)) if s == "408"
    );
}

#[tokio::test]
async fn handshake_without_nonce() {
    let server = FakeServer::start(|_: &Request| Reply::new(200)).await;

    let mut session = builder(&server).build().unwrap();

    assert_matches!(session.handshake().await,
                    Err(ProtocolError::HandshakeFailed { endpoint: NONCE_ENDPOINT, .. }));
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn handshake_with_malformed_nonce() {
    let server = FakeServer::start(|_: &Request| Reply::new(200).header("NONCE", "AAAA")).await;

    assert_matches!(builder(&server).connect().await,
                    Err(ProtocolError::Nonce { endpoint, .. }) if endpoint == NONCE_ENDPOINT);
}

#[tokio::test]
async fn handshake_with_non_ascii_nonce() {
    let server = FakeServer::start(|_: &Request| Reply::new(200).header("NONCE", "café")).await;

    let mut session = builder(&server).build().unwrap();

    assert_matches!(session.handshake().await,
                    Err(ProtocolError::Nonce { endpoint, .. }) if endpoint == NONCE_ENDPOINT);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.secrets().encrypted_nonce(), "");
}

#[tokio::test]
async fn nonce_rotated_by_error_reply() {
    let firmware = Arc::new(Firmware::new());
    let fus = fus_handler(firmware.clone(), "200");
    let server = FakeServer::start(move |request: &Request| {
        if request.path() == format!("/{BINARY_INIT_ENDPOINT}") {
            Reply::new(500).header("NONCE", ROTATED_NONCE_TOKEN)
        } else {
            fus(request)
        }
    }).await;
    let version: FwVersion = VERSION.parse().unwrap();

    let mut session = builder(&server).connect().await.unwrap();
    let metadata = FirmwareMetadata::fetch(&mut session, &version, MODEL, REGION,
                                           BinaryNature::Home).await.unwrap();

    assert_matches!(metadata.initialize_transfer(&mut session).await,
                    Err(MetadataError::Transport(TransportError::Status { status, .. }))
                        if status.as_u16() == 500);
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.secrets().nonce(), ROTATED_NONCE);
    assert_eq!(session.secrets().session_id(), SESSION_ID);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join(&metadata.file_name);
    TransferPipeline::new(&metadata, &path, TransferOptions::default())
        .run(&mut session, &mut Progress::default()).await.unwrap();
    assert_eq!(fs::read(&path).unwrap(), firmware.ciphertext);

    let requests = server.requests();
    assert_eq!(requests.len(), 4);

    // The failed request was still signed with the previous nonce
    let init_auth = requests[2].header("Authorization").unwrap();
    assert!(init_auth.contains(&format!("nonce=\"{TEST_NONCE_TOKEN}\"")));

    let download_auth = requests[3].header("Authorization").unwrap();
    assert!(download_auth.contains(&format!("nonce=\"{ROTATED_NONCE_TOKEN}\"")));
    assert!(download_auth.contains(&format!("signature=\"{ROTATED_SIGNATURE}\"")));
    assert_eq!(requests[3].header("Cookie"), Some(format!("JSESSIONID={SESSION_ID}").as_str()));
}

#[tokio::test]
async fn catalogue_lookup() {
    let server = FakeServer::start(|request: &Request| {
        if request.path() == format!("/firmware/{REGION}/{MODEL}/version.xml") {
            Reply::new(200).body(format!(
                "<versioninfo><firmware><version>\
                 <latest o=\"33\">{VERSION}</latest>\
                 <upgrade><value rcount=\"2\" fwsize=\"100\">A/B/C/D</value></upgrade>\
                 </version></firmware></versioninfo>"))
        } else {
            Reply::new(403)
        }
    }).await;

    let client = builder(&server).http_client().unwrap();
    let catalogue = Catalogue::with_base_url(client, server.url());

    assert!(catalogue.device_exists(MODEL, REGION).await.unwrap());
    assert!(!catalogue.device_exists("SM-NONE", REGION).await.unwrap());

    let history = catalogue.history(MODEL, REGION).await.unwrap();
    assert_eq!(history.latest.version, VERSION);
    assert_eq!(history.latest.android_level, Some(33));
    assert_eq!(history.old.len(), 1);

    assert!(catalogue.firmware_exists(MODEL, REGION, "A/B/C/D", false).await.unwrap());
    assert!(!catalogue.firmware_exists(MODEL, REGION, "A/B", false).await.unwrap());

    assert_matches!(catalogue.history("SM-NONE", REGION).await,
                    Err(CatalogueError::NotFound { model, .. }) if model == "SM-NONE");
}
