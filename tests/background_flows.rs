use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use compass_extension::background::{Background, Connection};
use compass_extension::config::ExtensionConfig;
use compass_extension::error::ExtensionError;
use compass_extension::keyring::{KeyPair, KeypairType};
use compass_extension::messages::{TransportRequest, TransportResponse, PORT_CONTENT, PORT_EXTENSION};
use compass_extension::password_cache::CachedPassword;
use compass_extension::storage::Stores;
use compass_extension::util::now_ms;

const PHRASE: &str = "seed sock milk update focus rotate barely fade car face mechanic mercy";
const PAGE: &str = "http://localhost:3000/app/index.html";
const ORIGIN: &str = "http://localhost:3000";
const PASSWORD: &str = "passw0rd";

async fn background() -> Arc<Background> {
    let mut config = ExtensionConfig::ephemeral();
    config.keyring.kdf_rounds = 1_000;
    Background::with_stores(config, Stores::memory()).await.unwrap()
}

fn frame(id: &str, message: &str, origin: Option<&str>, request: Value) -> TransportRequest {
    TransportRequest {
        id: id.to_string(),
        message: message.to_string(),
        origin: origin.map(str::to_string),
        request,
    }
}

/// Next non-subscription frame for `id`; anything else is skipped.
async fn response(conn: &mut Connection, id: &str) -> TransportResponse {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let frame = conn.recv().await.expect("port closed");
            if frame.id == id && frame.subscription.is_none() {
                return frame;
            }
        }
    })
    .await
    .expect("no response in time")
}

async fn popup_call(popup: &mut Connection, id: &str, message: &str, request: Value) -> TransportResponse {
    popup.send(frame(id, message, None, request));
    response(popup, id).await
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn create_account(popup: &mut Connection, kind: KeypairType, password: &str) -> String {
    let res = popup_call(
        popup,
        &format!("create-{}", kind),
        "pri(accounts.create.suri)",
        json!({ "name": format!("{} parent", kind), "password": password, "suri": PHRASE, "type": kind }),
    )
    .await;
    assert_eq!(res.response, Some(json!(true)), "{:?}", res.error);
    KeyPair::from_suri(kind, PHRASE).unwrap().address()
}

fn bytes_request(address: &str) -> Value {
    json!({ "address": address, "data": "0x1234", "type": "bytes" })
}

fn verify_sr25519(address: &str, signature: &str, message: &[u8]) -> bool {
    let public = schnorrkel::PublicKey::from_bytes(&hex::decode(&address[2..]).unwrap()).unwrap();
    let signature = schnorrkel::Signature::from_bytes(&hex::decode(&signature[2..]).unwrap()).unwrap();
    public.verify_simple(b"substrate", message, &signature).is_ok()
}

#[tokio::test]
async fn test_concurrent_connects_share_one_prompt() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let mut page = bg.connect(PORT_CONTENT, Some(1)).unwrap();
    let address = create_account(&mut popup, KeypairType::Sr25519, PASSWORD).await;

    page.send(frame("c1", "pub(connect)", Some(PAGE), json!({ "origin": "test dapp" })));
    page.send(frame("c2", "pub(authorize.tab)", Some(PAGE), json!({ "origin": "test dapp" })));
    wait_until(|| bg.state.authorize_requests().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let requests = bg.state.authorize_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, ORIGIN);
    assert_eq!(bg.state.badge(), "1");

    let res = popup_call(
        &mut popup,
        "approve",
        "pri(authorize.approve)",
        json!({ "id": requests[0].id, "authorizedAccounts": [address] }),
    )
    .await;
    assert_eq!(res.response, Some(json!(true)));

    for id in ["c1", "c2"] {
        let res = response(&mut page, id).await;
        let accounts = res.response.unwrap();
        assert_eq!(accounts.as_array().unwrap().len(), 1);
        assert_eq!(accounts[0]["address"], address.as_str());
    }
    assert!(bg.state.is_authorized(ORIGIN, &address).await);
    assert_eq!(bg.state.badge(), "");
}

#[tokio::test]
async fn test_rejected_connect_surfaces_error() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let mut page = bg.connect(PORT_CONTENT, Some(2)).unwrap();

    page.send(frame("c", "pub(connect)", Some(PAGE), json!({ "origin": "dapp" })));
    wait_until(|| !bg.state.authorize_requests().is_empty()).await;
    let id = bg.state.authorize_requests()[0].id.clone();
    popup_call(&mut popup, "r", "pri(authorize.reject)", json!({ "id": id })).await;

    let res = response(&mut page, "c").await;
    assert_eq!(res.error.as_deref(), Some("Rejected"));
    assert!(res.response.is_none());
    // the origin is listed with nothing granted
    assert!(bg.state.auth_url(ORIGIN).await.unwrap().authorized_accounts.is_empty());
}

#[tokio::test]
async fn test_wrong_password_keeps_request_pending() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let mut page = bg.connect(PORT_CONTENT, Some(3)).unwrap();
    let address = create_account(&mut popup, KeypairType::Sr25519, PASSWORD).await;
    bg.state.authorize(ORIGIN, "dapp", &[address.clone()]).await.unwrap();

    page.send(frame("s1", "pub(bytes.sign)", Some(PAGE), bytes_request(&address)));
    wait_until(|| !bg.state.signing_requests().is_empty()).await;
    let id = bg.state.signing_requests()[0].id.clone();

    let locked = popup_call(&mut popup, "l1", "pri(signing.isLocked)", json!({ "id": id })).await;
    assert_eq!(locked.response, Some(json!({ "isLocked": true, "remainingTime": 0 })));

    let wrong = popup_call(
        &mut popup,
        "w",
        "pri(signing.approve.password)",
        json!({ "id": id, "password": "nope", "savePass": false }),
    )
    .await;
    assert_eq!(wrong.error, Some(ExtensionError::invalid_password().to_string()));
    assert_eq!(bg.state.signing_requests().len(), 1);

    let ok = popup_call(
        &mut popup,
        "ok",
        "pri(signing.approve.password)",
        json!({ "id": id, "password": PASSWORD, "savePass": true }),
    )
    .await;
    assert_eq!(ok.response, Some(json!(true)), "{:?}", ok.error);

    let signed = response(&mut page, "s1").await.response.unwrap();
    assert_eq!(signed["id"], id.as_str());
    let signature = signed["signature"].as_str().unwrap();
    assert!(verify_sr25519(&address, signature, b"<Bytes>\x12\x34</Bytes>"));
    assert!(bg.state.signing_requests().is_empty());

    // the remembered password unlocks the next request
    page.send(frame("s2", "pub(bytes.sign)", Some(PAGE), bytes_request(&address)));
    wait_until(|| !bg.state.signing_requests().is_empty()).await;
    let next = bg.state.signing_requests()[0].id.clone();
    let locked = popup_call(&mut popup, "l2", "pri(signing.isLocked)", json!({ "id": next })).await;
    assert_eq!(locked.response.unwrap()["isLocked"], false);

    let cached = popup_call(&mut popup, "c", "pri(signing.approve.password)", json!({ "id": next })).await;
    assert_eq!(cached.response, Some(json!(true)), "{:?}", cached.error);
    assert!(response(&mut page, "s2").await.response.is_some());
}

#[tokio::test]
async fn test_expired_cached_password_is_ignored() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let mut page = bg.connect(PORT_CONTENT, Some(11)).unwrap();
    let address = create_account(&mut popup, KeypairType::Sr25519, PASSWORD).await;
    bg.state.authorize(ORIGIN, "dapp", &[address.clone()]).await.unwrap();

    let stale = CachedPassword {
        password: PASSWORD.to_string(),
        expires_at: now_ms() - 1,
    };
    bg.password_cache.set(&address, stale.clone()).await.unwrap();
    // still stored, the reader decides
    assert_eq!(bg.password_cache.get(&address).await, Some(stale));

    page.send(frame("s", "pub(bytes.sign)", Some(PAGE), bytes_request(&address)));
    wait_until(|| !bg.state.signing_requests().is_empty()).await;
    let id = bg.state.signing_requests()[0].id.clone();

    let locked = popup_call(&mut popup, "l", "pri(signing.isLocked)", json!({ "id": id })).await;
    assert_eq!(locked.response, Some(json!({ "isLocked": true, "remainingTime": 0 })));

    let res = popup_call(&mut popup, "a", "pri(signing.approve.password)", json!({ "id": id })).await;
    assert_eq!(
        res.error,
        Some(ExtensionError::InvalidPassword("Password required".into()).to_string())
    );
    assert_eq!(bg.state.signing_requests().len(), 1);

    let ok = popup_call(
        &mut popup,
        "b",
        "pri(signing.approve.password)",
        json!({ "id": id, "password": PASSWORD }),
    )
    .await;
    assert_eq!(ok.response, Some(json!(true)), "{:?}", ok.error);
    assert!(response(&mut page, "s").await.response.is_some());
}

#[tokio::test]
async fn test_origin_spellings_share_one_prompt() {
    let bg = background().await;
    let mut page = bg.connect(PORT_CONTENT, Some(12)).unwrap();

    page.send(frame("c1", "pub(connect)", Some(PAGE), json!({ "origin": "dapp" })));
    page.send(frame("c2", "pub(connect)", Some("HTTP://user@LocalHost:3000/other"), json!({ "origin": "dapp" })));
    page.send(frame("c3", "pub(connect)", Some("not a url"), json!({ "origin": "dapp" })));

    let bad = response(&mut page, "c3").await;
    assert!(bad.error.unwrap().starts_with("Invalid request: origin not a url"));
    wait_until(|| !bg.state.authorize_requests().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let requests = bg.state.authorize_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, ORIGIN);
}

#[tokio::test]
async fn test_sign_requires_authorized_origin() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let mut page = bg.connect(PORT_CONTENT, Some(4)).unwrap();
    let address = create_account(&mut popup, KeypairType::Ed25519, PASSWORD).await;

    page.send(frame("s", "pub(bytes.sign)", Some(PAGE), bytes_request(&address)));
    let res = response(&mut page, "s").await;
    assert_eq!(
        res.error,
        Some(ExtensionError::OriginNotAuthorized(ORIGIN.into()).to_string())
    );
    assert!(bg.state.signing_requests().is_empty());
}

#[tokio::test]
async fn test_unsupported_extension_never_queues() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let mut page = bg.connect(PORT_CONTENT, Some(5)).unwrap();
    let address = create_account(&mut popup, KeypairType::Sr25519, PASSWORD).await;
    bg.state.authorize(ORIGIN, "dapp", &[address.clone()]).await.unwrap();

    let payload = json!({
        "address": address,
        "blockHash": "0xe1b1dda72998846487e4d858909d4f9a6bbd6e338e4588e5d809de16b1317b80",
        "blockNumber": "0x00000393",
        "era": "0x3601",
        "genesisHash": "0x242a54b35e1aad38f37b884eddeb71f6f9931b02fac27bf52dfb62ef754e5e62",
        "method": "0x0403",
        "nonce": "0x00",
        "specVersion": "0x26",
        "tip": "0x00",
        "transactionVersion": "0x05",
        "signedExtensions": ["CheckNonce", "SomethingCustom"],
        "version": 4
    });
    page.send(frame("x", "pub(extrinsic.sign)", Some(PAGE), payload));
    let res = response(&mut page, "x").await;
    assert_eq!(
        res.error,
        Some(ExtensionError::UnsupportedSignedExtension("SomethingCustom".into()).to_string())
    );
    assert!(bg.state.signing_requests().is_empty());
}

#[tokio::test]
async fn test_second_resolve_is_not_found() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let mut page = bg.connect(PORT_CONTENT, Some(6)).unwrap();
    let address = create_account(&mut popup, KeypairType::Sr25519, PASSWORD).await;
    bg.state.authorize(ORIGIN, "dapp", &[address.clone()]).await.unwrap();

    page.send(frame("a", "pub(bytes.sign)", Some(PAGE), bytes_request(&address)));
    page.send(frame("b", "pub(bytes.sign)", Some(PAGE), bytes_request(&address)));
    wait_until(|| bg.state.signing_requests().len() == 2).await;
    let first = bg.state.signing_requests()[0].id.clone();

    let cancel = popup_call(&mut popup, "x1", "pri(signing.cancel)", json!({ "id": first })).await;
    assert_eq!(cancel.response, Some(json!(true)));
    let again = popup_call(&mut popup, "x2", "pri(signing.cancel)", json!({ "id": first })).await;
    assert_eq!(again.error, Some(ExtensionError::RequestNotFound(first.clone()).to_string()));

    let pending = bg.state.signing_requests();
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].id, first);

    let cancelled = response(&mut page, "a").await;
    assert_eq!(cancelled.error.as_deref(), Some("Cancelled"));
}

#[tokio::test]
async fn test_resolve_after_tab_disconnect() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let page = bg.connect(PORT_CONTENT, Some(7)).unwrap();
    let address = create_account(&mut popup, KeypairType::Sr25519, PASSWORD).await;
    bg.state.authorize(ORIGIN, "dapp", &[address.clone()]).await.unwrap();

    page.send(frame("s", "pub(bytes.sign)", Some(PAGE), bytes_request(&address)));
    wait_until(|| !bg.state.signing_requests().is_empty()).await;
    let id = bg.state.signing_requests()[0].id.clone();

    page.disconnect();
    wait_until(|| bg.ports.get(compass_extension::ports::PortKey::Content(7)).is_err()).await;

    let res = popup_call(
        &mut popup,
        "approve",
        "pri(signing.approve.password)",
        json!({ "id": id, "password": PASSWORD }),
    )
    .await;
    assert_eq!(res.response, Some(json!(true)), "{:?}", res.error);
    assert!(bg.state.signing_requests().is_empty());

    // the background keeps serving
    let res = popup_call(&mut popup, "list", "pri(authorize.list)", json!({})).await;
    assert!(res.response.unwrap()["list"][ORIGIN].is_object());
}

#[tokio::test]
async fn test_triple_slash_rejected_for_every_type() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();

    for kind in [
        KeypairType::Sr25519,
        KeypairType::Ed25519,
        KeypairType::Ecdsa,
        KeypairType::Ethereum,
    ] {
        let parent = create_account(&mut popup, kind, PASSWORD).await;
        let res = popup_call(
            &mut popup,
            &format!("v-{}", kind),
            "pri(derivation.validate)",
            json!({ "parentAddress": parent, "parentPassword": PASSWORD, "suri": "//a///secret" }),
        )
        .await;
        assert_eq!(
            res.error,
            Some(ExtensionError::UnsupportedDerivationSyntax.to_string()),
            "{}",
            kind
        );
    }
}

#[tokio::test]
async fn test_soft_segments_only_on_sr25519() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let ed = create_account(&mut popup, KeypairType::Ed25519, PASSWORD).await;
    let sr = create_account(&mut popup, KeypairType::Sr25519, PASSWORD).await;

    let res = popup_call(
        &mut popup,
        "ed",
        "pri(derivation.validate)",
        json!({ "parentAddress": ed, "parentPassword": PASSWORD, "suri": "//hard/soft" }),
    )
    .await;
    assert_eq!(
        res.error,
        Some(ExtensionError::UnsupportedSoftDerivation("ed25519".into()).to_string())
    );

    let hard_only = popup_call(
        &mut popup,
        "ed-hard",
        "pri(derivation.validate)",
        json!({ "parentAddress": ed, "parentPassword": PASSWORD, "suri": "//hard" }),
    )
    .await;
    assert!(hard_only.response.is_some(), "{:?}", hard_only.error);

    let res = popup_call(
        &mut popup,
        "sr",
        "pri(derivation.validate)",
        json!({ "parentAddress": sr, "parentPassword": PASSWORD, "suri": "//hard/soft" }),
    )
    .await;
    let derived = res.response.unwrap();
    assert_eq!(derived["suri"], "//hard/soft");
    assert_ne!(derived["address"], sr.as_str());
}

#[tokio::test]
async fn test_empty_hard_junction_and_create() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let parent = create_account(&mut popup, KeypairType::Sr25519, PASSWORD).await;

    let validated = popup_call(
        &mut popup,
        "v",
        "pri(derivation.validate)",
        json!({ "parentAddress": parent, "parentPassword": PASSWORD, "suri": "//" }),
    )
    .await
    .response
    .unwrap();
    let child = validated["address"].as_str().unwrap().to_string();
    assert_ne!(child, parent);
    // validation alone persists nothing
    assert!(!bg.keyring.contains(&child));

    let bad_parent = popup_call(
        &mut popup,
        "bad",
        "pri(derivation.validate)",
        json!({ "parentAddress": parent, "parentPassword": "wrong", "suri": "///x" }),
    )
    .await;
    assert_eq!(bad_parent.error, Some(ExtensionError::invalid_password().to_string()));

    let created = popup_call(
        &mut popup,
        "c",
        "pri(derivation.create)",
        json!({
            "name": "child",
            "parentAddress": parent,
            "parentPassword": PASSWORD,
            "password": "child-pass",
            "suri": "//"
        }),
    )
    .await;
    assert_eq!(created.response, Some(json!(true)), "{:?}", created.error);
    let account = bg.keyring.account(&child).unwrap();
    assert_eq!(account.meta.parent_address.as_deref(), Some(parent.as_str()));
    assert!(bg.keyring.check_password(&child, "child-pass").unwrap());
}

#[tokio::test]
async fn test_seed_validate_is_deterministic() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let request = json!({ "suri": format!("{}//polkadot/0", PHRASE), "type": "sr25519" });

    let a = popup_call(&mut popup, "a", "pri(seed.validate)", request.clone()).await;
    let b = popup_call(&mut popup, "b", "pri(seed.validate)", request).await;
    assert!(a.response.is_some(), "{:?}", a.error);
    assert_eq!(a.response, b.response);

    let bad = popup_call(
        &mut popup,
        "bad",
        "pri(seed.validate)",
        json!({ "suri": "not a real mnemonic phrase", "type": "sr25519" }),
    )
    .await;
    assert!(bad.error.unwrap().starts_with("Invalid seed or derivation path"));

    let created = popup_call(&mut popup, "new", "pri(seed.create)", json!({ "length": 24 })).await;
    let seed = created.response.unwrap();
    assert_eq!(seed["seed"].as_str().unwrap().split_whitespace().count(), 24);
}

#[tokio::test]
async fn test_page_cannot_call_popup_methods() {
    let bg = background().await;
    let mut page = bg.connect(PORT_CONTENT, Some(8)).unwrap();

    page.send(frame("f", "pri(accounts.forget)", Some(PAGE), json!({ "address": "0x00" })));
    let res = response(&mut page, "f").await;
    assert_eq!(
        res.error,
        Some(ExtensionError::UnknownMessage("pri(accounts.forget)".into()).to_string())
    );
}

#[tokio::test]
async fn test_popup_sees_authorize_requests_live() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let page = bg.connect(PORT_CONTENT, Some(9)).unwrap();

    let initial = popup_call(&mut popup, "sub", "pri(authorize.requests)", Value::Null).await;
    assert_eq!(initial.response, Some(json!([])));

    page.send(frame("c", "pub(connect)", Some(PAGE), json!({ "origin": "dapp" })));
    let update = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let frame = popup.recv().await.unwrap();
            if frame.id == "sub" && frame.subscription.is_some() {
                return frame.subscription.unwrap();
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(update[0]["url"], ORIGIN);
    assert_eq!(update[0]["request"]["origin"], "dapp");
}

#[tokio::test]
async fn test_metadata_provide_then_list() {
    let bg = background().await;
    let mut popup = bg.connect(PORT_EXTENSION, None).unwrap();
    let mut page = bg.connect(PORT_CONTENT, Some(10)).unwrap();

    let def = json!({
        "chain": "Development",
        "genesisHash": "0x242a54b35e1aad38f37b884eddeb71f6f9931b02fac27bf52dfb62ef754e5e62",
        "icon": "substrate",
        "ss58Format": 42,
        "specVersion": 38,
        "tokenDecimals": 12,
        "tokenSymbol": "UNIT",
        "types": {},
        "userExtensions": { "SomethingCustom": { "extrinsic": {}, "payload": {} } }
    });
    page.send(frame("m", "pub(metadata.provide)", Some(PAGE), def));
    wait_until(|| !bg.state.metadata_requests().is_empty()).await;
    let id = bg.state.metadata_requests()[0].id.clone();
    popup_call(&mut popup, "ok", "pri(metadata.approve)", json!({ "id": id })).await;

    assert_eq!(response(&mut page, "m").await.response, Some(json!(true)));

    page.send(frame("l", "pub(metadata.list)", Some(PAGE), Value::Null));
    let list = response(&mut page, "l").await.response.unwrap();
    assert_eq!(list[0]["specVersion"], 38);

    let got = popup_call(
        &mut popup,
        "g",
        "pri(metadata.get)",
        json!({ "genesisHash": "0x242a54b35e1aad38f37b884eddeb71f6f9931b02fac27bf52dfb62ef754e5e62" }),
    )
    .await;
    assert_eq!(got.response.unwrap()["chain"], "Development");
}
