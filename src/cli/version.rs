use larder::persistence::CipherSuite;

/// Display version information
pub fn execute() {
    println!("larder {}", env!("CARGO_PKG_VERSION"));
    println!("Encrypted, self-healing local key-value store");
    println!("Default cipher: {:?}", CipherSuite::default());
}
