mod request;
mod response;
mod stream;

pub use request::build_upstream;
pub use response::encode_response;
pub use stream::StreamEncoder;

#[cfg(test)]
mod tests;
