use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_member_tables::Migration),
            Box::new(m20250101_000002_create_catalog_tables::Migration),
            Box::new(m20250101_000003_create_cart_items_table::Migration),
            Box::new(m20250101_000004_create_order_tables::Migration),
            Box::new(m20250101_000005_create_payment_tables::Migration),
        ]
    }
}

mod m20250101_000001_create_member_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_member_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Members::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Members::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Members::Email)
                                .string_len(255)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Members::Name).string_len(100).not_null())
                        .col(ColumnDef::new(Members::PasswordHash).string().null())
                        .col(
                            ColumnDef::new(Members::Role)
                                .string_len(20)
                                .not_null()
                                .default("user"),
                        )
                        .col(ColumnDef::new(Members::SocialType).string_len(20).null())
                        .col(ColumnDef::new(Members::SocialId).string_len(255).null())
                        .col(
                            ColumnDef::new(Members::EmailVerified)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Members::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Members::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_members_social_identity")
                        .table(Members::Table)
                        .col(Members::SocialType)
                        .col(Members::SocialId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(RefreshTokens::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(RefreshTokens::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RefreshTokens::MemberId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(RefreshTokens::TokenId).string().not_null())
                        .col(
                            ColumnDef::new(RefreshTokens::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RefreshTokens::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RefreshTokens::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(EmailVerifications::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(EmailVerifications::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(EmailVerifications::MemberId).uuid().not_null())
                        .col(
                            ColumnDef::new(EmailVerifications::Token)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(EmailVerifications::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(EmailVerifications::VerifiedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(EmailVerifications::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(EmailVerifications::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(RefreshTokens::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Members::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Members {
        Table,
        Id,
        Email,
        Name,
        PasswordHash,
        Role,
        SocialType,
        SocialId,
        EmailVerified,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum RefreshTokens {
        Table,
        Id,
        MemberId,
        TokenId,
        ExpiresAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum EmailVerifications {
        Table,
        Id,
        MemberId,
        Token,
        ExpiresAt,
        VerifiedAt,
        CreatedAt,
    }
}

mod m20250101_000002_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Products::Name).string_len(200).not_null())
                        .col(ColumnDef::new(Products::Price).big_integer().not_null())
                        .col(
                            ColumnDef::new(Products::DiscountRate)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Products::ImageUrl).string().null())
                        .col(ColumnDef::new(Products::CategoryId).uuid().null())
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Skus::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Skus::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Skus::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Skus::Color).string_len(50).not_null())
                        .col(ColumnDef::new(Skus::Size).string_len(20).not_null())
                        .col(ColumnDef::new(Skus::CategoryId).uuid().null())
                        .col(ColumnDef::new(Skus::InitialStock).integer().not_null())
                        .col(
                            ColumnDef::new(Skus::AdditionalStock)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Skus::ProductStock).integer().not_null())
                        .col(
                            ColumnDef::new(Skus::IsSoldOut)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Skus::IsRestockAvailable)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Skus::IsRestocked)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Skus::Version).integer().not_null().default(1))
                        .col(
                            ColumnDef::new(Skus::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Skus::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_skus_product_id")
                                .from(Skus::Table, Skus::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_skus_variant")
                        .table(Skus::Table)
                        .col(Skus::ProductId)
                        .col(Skus::Color)
                        .col(Skus::Size)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Skus::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Name,
        Price,
        DiscountRate,
        ImageUrl,
        CategoryId,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Skus {
        Table,
        Id,
        ProductId,
        Color,
        Size,
        CategoryId,
        InitialStock,
        AdditionalStock,
        ProductStock,
        IsSoldOut,
        IsRestockAvailable,
        IsRestocked,
        Version,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000003_create_cart_items_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_cart_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CartItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(CartItems::MemberId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::SkuId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(CartItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_items_member_sku")
                        .table(CartItems::Table)
                        .col(CartItems::MemberId)
                        .col(CartItems::SkuId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CartItems {
        Table,
        Id,
        MemberId,
        SkuId,
        Quantity,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000004_create_order_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::MemberId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Orders::TotalPrice).big_integer().not_null())
                        .col(
                            ColumnDef::new(Orders::PaidAmount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::RefundedAmount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::RecipientName).string_len(100).not_null())
                        .col(ColumnDef::new(Orders::RecipientPhone).string_len(30).not_null())
                        .col(ColumnDef::new(Orders::ZipCode).string_len(10).not_null())
                        .col(ColumnDef::new(Orders::Address).string().not_null())
                        .col(ColumnDef::new(Orders::AddressDetail).string().null())
                        .col(ColumnDef::new(Orders::DeliveryMessage).string().null())
                        .col(ColumnDef::new(Orders::PaymentIntentId).string().null())
                        .col(
                            ColumnDef::new(Orders::OrderedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::Version).integer().not_null().default(1))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_member_id")
                        .table(Orders::Table)
                        .col(Orders::MemberId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status_updated_at")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .col(Orders::UpdatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderProducts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderProducts::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderProducts::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderProducts::SkuId).uuid().not_null())
                        .col(ColumnDef::new(OrderProducts::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(OrderProducts::ProductName)
                                .string_len(200)
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderProducts::Color).string_len(50).not_null())
                        .col(ColumnDef::new(OrderProducts::Size).string_len(20).not_null())
                        .col(ColumnDef::new(OrderProducts::ImageUrl).string().null())
                        .col(
                            ColumnDef::new(OrderProducts::UnitPrice)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderProducts::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderProducts::LineTotal)
                                .big_integer()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_products_order_id")
                                .from(OrderProducts::Table, OrderProducts::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(InventoryReservations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InventoryReservations::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryReservations::OrderId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InventoryReservations::SkuId).uuid().not_null())
                        .col(
                            ColumnDef::new(InventoryReservations::Quantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryReservations::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryReservations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryReservations::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_reservations_order_id")
                        .table(InventoryReservations::Table)
                        .col(InventoryReservations::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryReservations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(OrderProducts::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        MemberId,
        Status,
        TotalPrice,
        PaidAmount,
        RefundedAmount,
        RecipientName,
        RecipientPhone,
        ZipCode,
        Address,
        AddressDetail,
        DeliveryMessage,
        PaymentIntentId,
        OrderedAt,
        UpdatedAt,
        Version,
    }

    #[derive(DeriveIden)]
    enum OrderProducts {
        Table,
        Id,
        OrderId,
        SkuId,
        ProductId,
        ProductName,
        Color,
        Size,
        ImageUrl,
        UnitPrice,
        Quantity,
        LineTotal,
    }

    #[derive(DeriveIden)]
    enum InventoryReservations {
        Table,
        Id,
        OrderId,
        SkuId,
        Quantity,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000005_create_payment_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000005_create_payment_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentHistories::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentHistories::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentHistories::OrderId).uuid().not_null())
                        .col(ColumnDef::new(PaymentHistories::MemberId).uuid().not_null())
                        .col(
                            ColumnDef::new(PaymentHistories::ImpUid)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(PaymentHistories::Amount)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentHistories::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentHistories::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentHistories::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_histories_order_id")
                        .table(PaymentHistories::Table)
                        .col(PaymentHistories::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PaymentRefunds::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentRefunds::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentRefunds::PaymentHistoryId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentRefunds::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(PaymentRefunds::Amount)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentRefunds::Reason).string().null())
                        .col(
                            ColumnDef::new(PaymentRefunds::RefundedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentRefunds::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PaymentHistories::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentHistories {
        Table,
        Id,
        OrderId,
        MemberId,
        ImpUid,
        Amount,
        Status,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum PaymentRefunds {
        Table,
        Id,
        PaymentHistoryId,
        OrderId,
        Amount,
        Reason,
        RefundedAt,
    }
}
