use rand::RngCore;
use warden_settings::MIN_SECRET_BYTES;

use crate::cli::SecretArgs;
use crate::error::CliError;

pub fn generate_secret(args: SecretArgs) -> Result<(), CliError> {
    if args.bytes < MIN_SECRET_BYTES {
        return Err(CliError::Other(format!(
            "Secret must be at least {MIN_SECRET_BYTES} bytes"
        )));
    }
    let mut secret = vec![0u8; args.bytes];
    rand::thread_rng().fill_bytes(&mut secret);
    println!("{}", hex::encode(secret));
    Ok(())
}
