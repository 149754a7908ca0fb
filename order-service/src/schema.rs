// `status` and `created_at` are nullable in the DDL; rows holding NULL there
// fail to load and are skipped by the store.
diesel::table! {
    orders (id) {
        id -> Int4,
        user_id -> Int4,
        product_id -> Int4,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamp,
    }
}
