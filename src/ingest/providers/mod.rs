pub mod market_a;
pub mod market_b;
