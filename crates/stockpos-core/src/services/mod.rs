mod products;

pub use products::{
    is_barcode, Page, Product, ProductQuery, ProductService, UnitOfMeasure,
};
