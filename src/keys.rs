use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

/// Generates `count` fresh ed25519 keypairs and returns the public halves,
/// hex encoded, ready to seed a drop's key set. Secret halves are discarded;
/// this core only tracks public keys.
pub fn generate_public_keys(count: usize) -> Vec<String> {
    let mut rng = OsRng;
    (0..count)
        .map(|_| {
            let sk = SigningKey::generate(&mut rng);
            format!("ed25519:{}", hex::encode(sk.verifying_key().as_bytes()))
        })
        .collect()
}
