use super::Credential;

#[test]
fn test_verify_plain_password() {
    let credential = Credential::from_password("open sesame").unwrap();
    assert!(credential.verify("open sesame"));
    assert!(!credential.verify("open sesame "));
    assert!(!credential.verify(""));
}

#[test]
fn test_accepts_existing_hash() {
    let original = Credential::from_password("pw").unwrap();
    let reloaded = Credential::from_config(&original.phc).unwrap();
    assert!(reloaded.verify("pw"));
    assert!(!reloaded.verify("$argon2"));
}

#[test]
fn test_rejects_empty_and_broken_hash() {
    assert!(Credential::from_config("").is_err());
    assert!(Credential::from_config("$argon2 not a hash").is_err());
}

#[test]
fn test_debug_hides_hash() {
    let credential = Credential::from_password("pw").unwrap();
    assert_eq!(format!("{:?}", credential), "Credential(..)");
}
