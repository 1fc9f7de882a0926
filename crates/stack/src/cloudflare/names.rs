use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::seq::SliceRandom;
use rand::RngCore;

const ADJECTIVES: &[&str] = &[
    "able", "brave", "calm", "clever", "crisp", "eager", "fair", "fast", "fond", "glad", "golden",
    "happy", "honest", "keen", "kind", "lively", "lucky", "mellow", "merry", "noble", "polite",
    "proud", "quick", "quiet", "rapid", "ready", "sharp", "shy", "smart", "steady", "sunny",
    "swift", "tidy", "vast", "warm", "wise",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "dingo", "dolphin", "eagle", "falcon", "ferret", "gecko",
    "heron", "ibex", "jackal", "koala", "lemur", "lynx", "marmot", "moose", "newt", "otter",
    "panda", "pelican", "puffin", "quail", "raven", "salmon", "seal", "sloth", "stork", "tapir",
    "toucan", "turtle", "walrus", "wombat", "yak", "zebra",
];

/// Two-word name such as `swift-otter`, used as a tunnel name suffix.
#[must_use]
pub fn pet_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("steady");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{adjective}-{animal}")
}

/// Base64 of 32 random bytes.
#[must_use]
pub fn tunnel_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pet_name_shape() {
        let name = pet_name();
        let (adjective, animal) = name.split_once('-').unwrap();
        assert!(ADJECTIVES.contains(&adjective));
        assert!(ANIMALS.contains(&animal));
    }

    #[test]
    fn test_secret_is_32_bytes() {
        let secret = tunnel_secret();
        assert_eq!(STANDARD.decode(&secret).unwrap().len(), 32);
        assert_ne!(secret, tunnel_secret());
    }
}
