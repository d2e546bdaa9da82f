//! Embeds a development key pair from `certs/` when one is present, so
//! `apkzip sign` works without `-k`/`-p`.

use std::{env, fs, io, path::PathBuf};

fn main() -> io::Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").map_err(io::Error::other)?);
    let certs_dir = PathBuf::from("certs");
    let key_path = certs_dir.join("private_key.pem");
    let cert_path = certs_dir.join("public_cert.pem");

    println!("cargo:rustc-check-cfg=cfg(has_merged_keys)");
    println!("cargo:rerun-if-changed={}", key_path.display());
    println!("cargo:rerun-if-changed={}", cert_path.display());

    if !(key_path.exists() && cert_path.exists()) {
        return Ok(());
    }
    let key = fs::read_to_string(&key_path)?;
    let cert = fs::read_to_string(&cert_path)?;
    fs::write(
        out_dir.join("merged_keys.rs"),
        format!(
            "pub const PRIVATE_KEY: &str = {:?};\npub const PUBLIC_KEY: &str = {:?};\n",
            key, cert
        ),
    )?;
    println!("cargo:rustc-cfg=has_merged_keys");
    Ok(())
}
