mod encoder;
mod support;
