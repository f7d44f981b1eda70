//! Wire types shared between `replicate-server` and `replicate-client`: ids,
//! the framed transport codec, the message envelope, the identifier
//! channel, the value codec, and `ResourceSpec`.

pub mod auth_token;
pub mod element;
pub mod framed;
pub mod identifiers;
pub mod ids;
pub mod message;
pub mod resource_spec;
pub mod value;
