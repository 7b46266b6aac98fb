use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_users_and_products::Migration),
            Box::new(m20240601_000002_create_vouchers::Migration),
            Box::new(m20240601_000003_create_orders_and_payments::Migration),
            Box::new(m20240601_000004_create_ledger_entries::Migration),
        ]
    }
}

mod m20240601_000001_create_users_and_products {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_users_and_products"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Users::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Users::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Users::Username)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(Users::Tier)
                                .string_len(16)
                                .not_null()
                                .default("REGULAR"),
                        )
                        .col(
                            ColumnDef::new(Users::Balance)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Users::Whatsapp).string().null())
                        .col(
                            ColumnDef::new(Users::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Users::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Products::Code)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::CategoryId).uuid().not_null())
                        .col(ColumnDef::new(Products::ProviderSku).string().not_null())
                        .col(ColumnDef::new(Products::PriceRegular).big_integer().not_null())
                        .col(ColumnDef::new(Products::PriceGold).big_integer().not_null())
                        .col(
                            ColumnDef::new(Products::PricePlatinum)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::PriceReseller)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::ProfitRegular)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::ProfitGold)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::ProfitPlatinum)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::ProfitReseller)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::IsFlashSale)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Products::FlashSalePrice).big_integer().null())
                        .col(
                            ColumnDef::new(Products::FlashSaleExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Products::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
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
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Users::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Users {
        Table,
        Id,
        Username,
        Tier,
        Balance,
        Whatsapp,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Code,
        Name,
        CategoryId,
        ProviderSku,
        PriceRegular,
        PriceGold,
        PricePlatinum,
        PriceReseller,
        ProfitRegular,
        ProfitGold,
        ProfitPlatinum,
        ProfitReseller,
        IsFlashSale,
        FlashSalePrice,
        FlashSaleExpiresAt,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_vouchers {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_vouchers"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Vouchers::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Vouchers::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Vouchers::Code)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Vouchers::DiscountType).string_len(16).not_null())
                        .col(ColumnDef::new(Vouchers::DiscountValue).big_integer().not_null())
                        .col(ColumnDef::new(Vouchers::MaxDiscount).big_integer().null())
                        .col(ColumnDef::new(Vouchers::MinPurchase).big_integer().null())
                        .col(ColumnDef::new(Vouchers::UsageLimit).integer().null())
                        .col(
                            ColumnDef::new(Vouchers::UsageCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Vouchers::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Vouchers::IsForAllCategories)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Vouchers::StartDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Vouchers::ExpiryDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Vouchers::Description).string().null())
                        .col(
                            ColumnDef::new(Vouchers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Vouchers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(VoucherCategories::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(VoucherCategories::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(VoucherCategories::VoucherId).uuid().not_null())
                        .col(
                            ColumnDef::new(VoucherCategories::CategoryId)
                                .uuid()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_voucher_categories_voucher_id")
                                .from(VoucherCategories::Table, VoucherCategories::VoucherId)
                                .to(Vouchers::Table, Vouchers::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_voucher_categories_voucher_category")
                        .table(VoucherCategories::Table)
                        .col(VoucherCategories::VoucherId)
                        .col(VoucherCategories::CategoryId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(VoucherCategories::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Vouchers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Vouchers {
        Table,
        Id,
        Code,
        DiscountType,
        DiscountValue,
        MaxDiscount,
        MinPurchase,
        UsageLimit,
        UsageCount,
        IsActive,
        IsForAllCategories,
        StartDate,
        ExpiryDate,
        Description,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum VoucherCategories {
        Table,
        Id,
        VoucherId,
        CategoryId,
    }
}

mod m20240601_000003_create_orders_and_payments {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_orders_and_payments"
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
                        .col(
                            ColumnDef::new(Orders::OrderId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::OrderType).string_len(16).not_null())
                        .col(ColumnDef::new(Orders::ProductRef).string().null())
                        .col(ColumnDef::new(Orders::ProductName).string().null())
                        .col(ColumnDef::new(Orders::ProviderSku).string().null())
                        .col(ColumnDef::new(Orders::BuyerReference).string().not_null())
                        .col(ColumnDef::new(Orders::CustomerPhone).string().null())
                        .col(ColumnDef::new(Orders::Username).string().null())
                        .col(ColumnDef::new(Orders::VoucherId).uuid().null())
                        .col(ColumnDef::new(Orders::ChargeAmount).big_integer().not_null())
                        .col(
                            ColumnDef::new(Orders::DiscountAmount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::FinalAmount).big_integer().not_null())
                        .col(
                            ColumnDef::new(Orders::ExpectedProfit)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::PurchasePrice).big_integer().null())
                        .col(ColumnDef::new(Orders::ProfitAmount).big_integer().null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string().not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Orders::ProviderReference).string().null())
                        .col(ColumnDef::new(Orders::Log).text().null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
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
                        .name("idx_orders_username")
                        .table(Orders::Table)
                        .col(Orders::Username)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Payments::OrderId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Payments::Method).string().not_null())
                        .col(ColumnDef::new(Payments::AmountDue).big_integer().not_null())
                        .col(
                            ColumnDef::new(Payments::Fee)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Payments::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Payments::ExternalReference).string().null())
                        .col(ColumnDef::new(Payments::PaymentTarget).text().null())
                        .col(ColumnDef::new(Payments::StatusMessage).string().null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_order_id")
                                .from(Payments::Table, Payments::OrderId)
                                .to(Orders::Table, Orders::OrderId),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
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
        OrderId,
        OrderType,
        ProductRef,
        ProductName,
        ProviderSku,
        BuyerReference,
        CustomerPhone,
        Username,
        VoucherId,
        ChargeAmount,
        DiscountAmount,
        FinalAmount,
        ExpectedProfit,
        PurchasePrice,
        ProfitAmount,
        PaymentMethod,
        Status,
        ProviderReference,
        Log,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        OrderId,
        Method,
        AmountDue,
        Fee,
        Status,
        ExternalReference,
        PaymentTarget,
        StatusMessage,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000004_create_ledger_entries {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_ledger_entries"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(LedgerEntries::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(LedgerEntries::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(LedgerEntries::Username).string().not_null())
                        .col(
                            ColumnDef::new(LedgerEntries::ChangeType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LedgerEntries::AmountDelta)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LedgerEntries::BalanceBefore)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LedgerEntries::BalanceAfter)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(LedgerEntries::Description).string().not_null())
                        .col(ColumnDef::new(LedgerEntries::OrderRef).string().null())
                        .col(
                            ColumnDef::new(LedgerEntries::CreatedAt)
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
                        .name("idx_ledger_entries_username")
                        .table(LedgerEntries::Table)
                        .col(LedgerEntries::Username)
                        .col(LedgerEntries::Id)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(LedgerEntries::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum LedgerEntries {
        Table,
        Id,
        Username,
        ChangeType,
        AmountDelta,
        BalanceBefore,
        BalanceAfter,
        Description,
        OrderRef,
        CreatedAt,
    }
}
