use serde_json::json;

use crate::crypto::EcuKey;
use crate::crypto::keys::PublicKey;
use crate::error::{ErrorCategory, UpdateError};
use crate::manifest::{
    EcuManifest, ExpectedSigner, KeyRing, Signable, VehicleManifest, build_ecu_manifest,
    build_vehicle_manifest, verify,
};
use crate::types::{EcuSerial, FileInfo, Nonce, TargetInfo, Vin};

fn firmware() -> TargetInfo {
    TargetInfo::new("/secondary_firmware.txt", FileInfo::from_bytes(b"factory firmware"))
}

fn signed_manifest(key: &EcuKey) -> Signable<EcuManifest> {
    build_ecu_manifest(&EcuSerial::from("22222"), &firmware(), "", Nonce(5), key).unwrap()
}

#[test]
fn test_ecu_manifest_verifies_with_signer_key() {
    let key = EcuKey::generate();
    let manifest = signed_manifest(&key);

    assert_eq!(manifest.signed.nonce, Nonce(5));
    assert_eq!(manifest.signatures.len(), 1);
    assert_eq!(manifest.signatures[0].keyid, key.keyid());
    verify(&manifest, ExpectedSigner::Key(&key.public_key())).expect("valid manifest should verify");
}

#[test]
fn test_ecu_manifest_is_deterministic() {
    let key = EcuKey::generate();
    assert_eq!(signed_manifest(&key), signed_manifest(&key));
}

#[test]
fn test_tamper_without_resign_fails_verification() {
    let key = EcuKey::generate();
    let pk = key.public_key();

    let mut attacks = signed_manifest(&key);
    attacks.signed.attacks_detected = "everything is great; I PROMISE!".into();
    let err = verify(&attacks, ExpectedSigner::Key(&pk)).unwrap_err();
    assert!(matches!(err, UpdateError::Signature(_)));
    assert_eq!(err.category(), ErrorCategory::Validation);

    let mut image = signed_manifest(&key);
    image.signed.installed_image.fileinfo.length += 1;
    assert!(matches!(verify(&image, ExpectedSigner::Key(&pk)), Err(UpdateError::Signature(_))));

    let mut nonce = signed_manifest(&key);
    nonce.signed.nonce = Nonce(6);
    assert!(matches!(verify(&nonce, ExpectedSigner::Key(&pk)), Err(UpdateError::Signature(_))));
}

#[test]
fn test_tamper_and_resign_with_wrong_key_fails_verification() {
    let legitimate = EcuKey::generate();
    let attacker = EcuKey::generate();

    let mut body = signed_manifest(&legitimate).signed;
    body.installed_image = TargetInfo::new("/secondary_firmware.txt", FileInfo::from_bytes(b"evil"));
    let forged = Signable::sign(body, &attacker).unwrap();

    // The forgery is internally consistent...
    verify(&forged, ExpectedSigner::Key(&attacker.public_key())).unwrap();
    // ...but not signed by the ECU it claims to come from.
    let err = verify(&forged, ExpectedSigner::Key(&legitimate.public_key())).unwrap_err();
    assert!(matches!(err, UpdateError::Signature(_)));

    let ring: KeyRing = [legitimate.public_key()].into_iter().collect();
    assert!(matches!(verify(&forged, ExpectedSigner::AnyOf(&ring)), Err(UpdateError::Signature(_))));
}

#[test]
fn test_signature_with_spoofed_keyid_fails() {
    let legitimate = EcuKey::generate();
    let attacker = EcuKey::generate();

    let mut forged = signed_manifest(&attacker);
    forged.signatures[0].keyid = legitimate.keyid();

    let err = verify(&forged, ExpectedSigner::Key(&legitimate.public_key())).unwrap_err();
    assert!(matches!(err, UpdateError::Signature(_)));
}

#[test]
fn test_from_value_rejects_malformed_payloads() {
    let key = EcuKey::generate();
    let valid = signed_manifest(&key).to_value().unwrap();

    let garbage = Signable::<EcuManifest>::from_value(json!({"hello": "world"}));
    assert!(matches!(garbage, Err(UpdateError::Schema(_))));

    let mut unsigned = valid.clone();
    unsigned["signatures"] = json!([]);
    assert!(matches!(Signable::<EcuManifest>::from_value(unsigned), Err(UpdateError::Schema(_))));

    let mut extra_field = valid.clone();
    extra_field["signed"]["firmware_override"] = json!(true);
    assert!(matches!(Signable::<EcuManifest>::from_value(extra_field), Err(UpdateError::Schema(_))));

    let mut bad_sig = valid.clone();
    bad_sig["signatures"][0]["sig"] = json!("not-hex");
    assert!(matches!(Signable::<EcuManifest>::from_value(bad_sig), Err(UpdateError::Schema(_))));

    let mut no_hashes = valid.clone();
    no_hashes["signed"]["installed_image"]["fileinfo"]["hashes"] = json!({});
    assert!(matches!(Signable::<EcuManifest>::from_value(no_hashes), Err(UpdateError::Schema(_))));

    let parsed = Signable::<EcuManifest>::from_value(valid).unwrap();
    verify(&parsed, ExpectedSigner::Key(&key.public_key())).unwrap();
}

#[test]
fn test_unknown_keys_inside_installed_image_are_refused() {
    let key = EcuKey::generate();
    let valid = signed_manifest(&key).to_value().unwrap();

    // Dropping these silently would verify a body other than the one sent.
    let mut in_target = valid.clone();
    in_target["signed"]["installed_image"]["vendor_note"] = json!("trust me");
    assert!(matches!(Signable::<EcuManifest>::from_value(in_target), Err(UpdateError::Schema(_))));

    let mut in_fileinfo = valid.clone();
    in_fileinfo["signed"]["installed_image"]["fileinfo"]["md5"] = json!("00");
    assert!(matches!(Signable::<EcuManifest>::from_value(in_fileinfo), Err(UpdateError::Schema(_))));

    // `custom` is the place for repository-specific extras.
    let mut with_custom = valid;
    with_custom["signed"]["installed_image"]["custom"] = json!({"ecu": "22222"});
    let parsed = Signable::<EcuManifest>::from_value(with_custom).unwrap();
    assert!(verify(&parsed, ExpectedSigner::Key(&key.public_key())).is_err());
}

#[test]
fn test_vehicle_manifest_groups_by_serial() {
    let primary = EcuKey::generate();
    let secondary = EcuKey::generate();
    let other = EcuKey::generate();

    let first = signed_manifest(&secondary);
    let second = build_ecu_manifest(&EcuSerial::from("33333"), &firmware(), "", Nonce(9), &other).unwrap();

    let vehicle = build_vehicle_manifest(
        &Vin::from("111"),
        &EcuSerial::from("11111"),
        vec![first.clone(), second],
        &primary,
    )
    .unwrap();

    assert_eq!(vehicle.signed.ecu_manifest_count(), 2);
    assert_eq!(vehicle.signed.ecu_version_manifests[&EcuSerial::from("22222")], vec![first]);
    verify(&vehicle, ExpectedSigner::Key(&primary.public_key())).unwrap();
    assert!(verify(&vehicle, ExpectedSigner::Key(&secondary.public_key())).is_err());
}

#[test]
fn test_vehicle_manifest_rejects_misfiled_ecu_manifest() {
    let primary = EcuKey::generate();
    let manifest = signed_manifest(&EcuKey::generate());

    let mut value = build_vehicle_manifest(&Vin::from("111"), &EcuSerial::from("11111"), vec![manifest], &primary)
        .unwrap()
        .to_value()
        .unwrap();
    let entries = value["signed"]["ecu_version_manifests"]["22222"].take();
    value["signed"]["ecu_version_manifests"] = json!({ "33333": entries });

    let err = Signable::<VehicleManifest>::from_value(value).unwrap_err();
    assert!(matches!(err, UpdateError::Schema(_)));
}

#[test]
fn test_public_key_hex_round_trip_and_keyid() {
    let key = EcuKey::generate();
    let pk = key.public_key();

    let parsed = PublicKey::from_hex(&pk.to_hex()).unwrap();
    assert_eq!(parsed, pk);
    assert_eq!(pk.keyid().len(), 64);
    assert!(PublicKey::from_hex("abcd").is_err());
}

#[test]
fn test_key_file_is_reused_unless_new_key_requested() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys").join("secondary");

    let generated = EcuKey::load_or_generate(&path, false).unwrap();
    let loaded = EcuKey::load_or_generate(&path, false).unwrap();
    assert_eq!(generated.keyid(), loaded.keyid());
    assert_eq!(PublicKey::load(&crate::crypto::keys::public_key_path(&path)).unwrap(), generated.public_key());

    let replaced = EcuKey::load_or_generate(&path, true).unwrap();
    assert_ne!(replaced.keyid(), generated.keyid());
}
