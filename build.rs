fn main() {
    println!("cargo:rerun-if-env-changed=FLOWNOTE_SQLCIPHER_STATIC");
    println!("cargo:rerun-if-env-changed=FLOWNOTE_SQLCIPHER_KEY");

    // Enable FTS5 and JSON1 when building the bundled SQLCipher library.
    println!("cargo:rustc-env=SQLCIPHER_ENABLE_FTS5=1");
    println!("cargo:rustc-env=SQLCIPHER_ENABLE_JSON1=1");
}
