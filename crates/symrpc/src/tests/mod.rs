mod support;

mod concurrency;
mod links;
mod timeout;
