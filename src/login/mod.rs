//! Portal login: session reuse, credential entry, challenge resolution, verification

mod credentials;
mod machine;
pub mod scripts;

pub use credentials::{Credentials, CredentialsProvider, StaticCredentials};
pub use machine::{ChallengeReceipt, LoginMachine, LoginMode, LoginOutcome, LoginState};
